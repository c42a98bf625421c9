//! One-shot backup request actions
//!
//! These record that a backup was requested for a managed component. They have
//! no completion tracking, so the reconciler neither changes the SOP phase nor
//! requeues after running them.

use super::{ActionKind, Outcome, SopAction};
use crate::controller::cluster::ClusterApi;
use async_trait::async_trait;
use tracing::info;

pub const THREE_SCALE_BACKUP: &str = "3scale-backup";
pub const AMQ_BACKUP: &str = "amq-backup";

pub struct BackupRequestAction {
    identifier: &'static str,
    component: &'static str,
}

impl BackupRequestAction {
    pub fn three_scale() -> Self {
        BackupRequestAction {
            identifier: THREE_SCALE_BACKUP,
            component: "3scale",
        }
    }

    pub fn amq() -> Self {
        BackupRequestAction {
            identifier: AMQ_BACKUP,
            component: "AMQ",
        }
    }

    pub fn component(&self) -> &str {
        self.component
    }
}

#[async_trait]
impl SopAction for BackupRequestAction {
    fn identifier(&self) -> &str {
        self.identifier
    }

    fn kind(&self) -> ActionKind {
        ActionKind::OneShot
    }

    async fn execute(&self, _cluster: &dyn ClusterApi) -> Outcome {
        info!(
            sop_action = self.identifier,
            component = self.component,
            "Backup requested"
        );
        Outcome::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::cluster::MockCluster;

    #[test]
    fn test_backup_actions_are_one_shot() {
        assert_eq!(BackupRequestAction::three_scale().kind(), ActionKind::OneShot);
        assert_eq!(BackupRequestAction::amq().kind(), ActionKind::OneShot);
    }

    #[test]
    fn test_backup_action_identifiers() {
        let three_scale = BackupRequestAction::three_scale();
        assert_eq!(three_scale.identifier(), "3scale-backup");
        assert_eq!(three_scale.component(), "3scale");

        let amq = BackupRequestAction::amq();
        assert_eq!(amq.identifier(), "amq-backup");
        assert_eq!(amq.component(), "AMQ");
    }

    #[tokio::test]
    async fn test_backup_action_does_not_write_to_cluster() {
        let cluster = MockCluster::new();

        let outcome = BackupRequestAction::amq().execute(&cluster).await;

        assert_eq!(outcome, Outcome::Ready);
        assert_eq!(cluster.write_count(), 0);
    }
}
