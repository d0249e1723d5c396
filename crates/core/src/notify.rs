//! Seam between the `notify_role` tool and the chat orchestrator.

use async_trait::async_trait;

use crate::error::Result;

/// Something that can run one turn against another role on a user's behalf.
#[async_trait]
pub trait RoleNotifier: Send + Sync {
    /// Open a fresh session for `target_role_id`, send `message`, and return
    /// the target's final text response.
    async fn notify_role(&self, user_id: &str, target_role_id: &str, message: &str) -> Result<String>;
}
