//! Teardown command - ask a running node to stop
//!
//! Requests are files under `<data_root>/teardown/` named by service id.
//! A serving node polls for its own file and routes it into the same
//! shutdown path as Ctrl-C.

use crate::cli::args::TeardownArgs;
use crate::config::{is_plain_name, Config};
use crate::error::{MeshError, MeshResult};
use crate::ui;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Request file for `service_id`
pub fn teardown_request_path(data_root: &Path, service_id: &str) -> PathBuf {
    data_root.join("teardown").join(service_id)
}

/// Service ids double as file names
pub fn validate_service_id(service_id: &str) -> MeshResult<()> {
    if !is_plain_name(service_id) {
        return Err(MeshError::InvalidServiceId(service_id.to_string()));
    }
    Ok(())
}

/// Execute the teardown command
pub async fn execute(args: TeardownArgs, config: &Config) -> MeshResult<()> {
    validate_service_id(&args.service_id)?;

    let path = teardown_request_path(&config.data_root(), &args.service_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| MeshError::io(format!("creating {}", parent.display()), e))?;
    }
    fs::write(&path, Utc::now().to_rfc3339())
        .await
        .map_err(|e| MeshError::io(format!("writing {}", path.display()), e))?;

    ui::step_ok_detail("Teardown requested", &args.service_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_ids_must_be_plain_names() {
        assert!(validate_service_id("node-1").is_ok());
        assert!(validate_service_id("").is_err());
        assert!(validate_service_id("..").is_err());
        assert!(validate_service_id("a/b").is_err());
    }

    #[test]
    fn request_path_is_under_data_root() {
        assert_eq!(
            teardown_request_path(Path::new("/srv/mesh"), "node-1"),
            PathBuf::from("/srv/mesh/teardown/node-1")
        );
    }
}
