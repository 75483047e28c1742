use std::path::Path;
use tracing::{info, warn};

use super::atomic::{persist_with_retry, read_json_tolerant};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::selector::CouplingMatrix;

/// Loads the persisted coupling matrix, or identity when it is absent,
/// corrupt or shaped for a different channel set.
pub async fn load_matrix(path: &Path, channels: &[String]) -> CouplingMatrix {
    match read_json_tolerant::<CouplingMatrix>(path, "coupling matrix").await.value() {
        Some(matrix) => match matrix.check_against(channels) {
            Ok(()) => {
                info!("coupling matrix loaded ({} channels)", matrix.dim());
                matrix
            }
            Err(reason) => {
                warn!("stored coupling matrix rejected ({}), starting from identity", reason);
                CouplingMatrix::identity(channels)
            }
        },
        None => CouplingMatrix::identity(channels),
    }
}

pub async fn save_matrix(path: &Path, matrix: &CouplingMatrix, policy: &StoreConfig) -> Result<u32, StoreError> {
    persist_with_retry(path, matrix, policy).await
}
