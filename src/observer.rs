//! Migration observer trait

use crate::{ObjectKey, RunId};

/// Observer trait for external observability
pub trait MigrationObserver: Send + Sync + 'static {
    fn on_run_started(&self, run_id: RunId, resumed: bool);
    fn on_phase_started(&self, phase: &str);
    fn on_phase_completed(&self, phase: &str, objects: usize);
    fn on_phase_failed(&self, phase: &str, reason: &str);
    fn on_phase_blocked(&self, phase: &str, waiting_on: &[String]);
    fn on_object_completed(&self, phase: &str, key: &ObjectKey, destination_id: &str, attempts: u32);
    fn on_object_adopted(&self, phase: &str, key: &ObjectKey, destination_id: &str);
    fn on_object_skipped(&self, phase: &str, key: &ObjectKey, reason: &str);
    fn on_object_failed(&self, phase: &str, key: &ObjectKey, error: &str);
    fn on_rollback_warning(&self, phase: &str, destination_id: &str, error: &str);
    fn on_run_finished(&self, run_id: RunId, success: bool, cancelled: bool);
}

/// No-op observer
pub struct NoOpObserver;

impl MigrationObserver for NoOpObserver {
    fn on_run_started(&self, _run_id: RunId, _resumed: bool) {}
    fn on_phase_started(&self, _phase: &str) {}
    fn on_phase_completed(&self, _phase: &str, _objects: usize) {}
    fn on_phase_failed(&self, _phase: &str, _reason: &str) {}
    fn on_phase_blocked(&self, _phase: &str, _waiting_on: &[String]) {}
    fn on_object_completed(&self, _phase: &str, _key: &ObjectKey, _destination_id: &str, _attempts: u32) {}
    fn on_object_adopted(&self, _phase: &str, _key: &ObjectKey, _destination_id: &str) {}
    fn on_object_skipped(&self, _phase: &str, _key: &ObjectKey, _reason: &str) {}
    fn on_object_failed(&self, _phase: &str, _key: &ObjectKey, _error: &str) {}
    fn on_rollback_warning(&self, _phase: &str, _destination_id: &str, _error: &str) {}
    fn on_run_finished(&self, _run_id: RunId, _success: bool, _cancelled: bool) {}
}

/// Tracing-based observer
pub struct TracingObserver;

impl MigrationObserver for TracingObserver {
    fn on_run_started(&self, run_id: RunId, resumed: bool) {
        tracing::info!(run_id = %run_id, resumed, "Migration run started");
    }

    fn on_phase_started(&self, phase: &str) {
        tracing::info!(phase = %phase, "Phase started");
    }

    fn on_phase_completed(&self, phase: &str, objects: usize) {
        tracing::info!(phase = %phase, objects, "Phase completed");
    }

    fn on_phase_failed(&self, phase: &str, reason: &str) {
        tracing::error!(phase = %phase, reason = %reason, "Phase failed");
    }

    fn on_phase_blocked(&self, phase: &str, waiting_on: &[String]) {
        tracing::warn!(phase = %phase, waiting_on = ?waiting_on, "Phase blocked on incomplete dependencies");
    }

    fn on_object_completed(&self, phase: &str, key: &ObjectKey, destination_id: &str, attempts: u32) {
        tracing::debug!(phase = %phase, object_key = %key, destination_id = %destination_id, attempts, "Object created");
    }

    fn on_object_adopted(&self, phase: &str, key: &ObjectKey, destination_id: &str) {
        tracing::info!(phase = %phase, object_key = %key, destination_id = %destination_id, "Adopted existing destination object");
    }

    fn on_object_skipped(&self, phase: &str, key: &ObjectKey, reason: &str) {
        tracing::debug!(phase = %phase, object_key = %key, reason = %reason, "Object skipped");
    }

    fn on_object_failed(&self, phase: &str, key: &ObjectKey, error: &str) {
        tracing::warn!(phase = %phase, object_key = %key, error = %error, "Object failed");
    }

    fn on_rollback_warning(&self, phase: &str, destination_id: &str, error: &str) {
        tracing::warn!(phase = %phase, destination_id = %destination_id, error = %error, "Rollback deletion failed");
    }

    fn on_run_finished(&self, run_id: RunId, success: bool, cancelled: bool) {
        if success {
            tracing::info!(run_id = %run_id, "Migration run completed");
        } else {
            tracing::warn!(run_id = %run_id, cancelled, "Migration run finished with incomplete phases");
        }
    }
}
