// SPDX-FileCopyrightText: 2026 Zapgate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Boot-time rehydration: recreate sessions from durable intent.
//!
//! Every row with `enabled = true` gets a staggered start so the browser
//! layer is not hit by a thundering herd.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::SessionEngine;

impl SessionEngine {
    /// Start every enabled instance, spacing the starts out.
    pub async fn rehydrate(self: &Arc<Self>) {
        let rows = match self.store.list_enabled().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "rehydration scan failed; the recovery sweep takes over");
                return;
            }
        };

        if rows.is_empty() {
            info!("no enabled instances to rehydrate");
            return;
        }

        info!(count = rows.len(), "rehydrating enabled instances");

        for record in rows {
            if self.shutdown.is_cancelled() {
                break;
            }

            if let Err(e) = self
                .store
                .update_status(&record.id, "RECONNECTING", None)
                .await
            {
                warn!(instance_id = record.id.as_str(), error = %e, "status persist failed");
            }

            tokio::time::sleep(self.policy.rehydrate_stagger()).await;

            if let Err(e) = self.start_instance(&record.id).await {
                warn!(
                    instance_id = record.id.as_str(),
                    error = %e,
                    "rehydration start failed, the recovery sweep will retry"
                );
            }
        }

        info!("rehydration pass complete");
    }
}
