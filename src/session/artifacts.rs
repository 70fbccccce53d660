//! Saving what a session's roles left behind

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use super::instance::{RoleInstance, SessionInstance};
use super::role::SessionRole;
use crate::common::Result;
use crate::device::AppInstance;
use crate::log_parser::LogParser;

/// The saved output of one role
pub struct RoleArtifacts {
    pub role: SessionRole,
    pub instance: Arc<dyn AppInstance>,
    /// Folder everything for this role was written to
    pub artifact_path: PathBuf,
    /// `<Role>Output.log` inside `artifact_path`
    pub log_path: PathBuf,
    pub log_parser: LogParser,
}

/// Folder names for each role: the first of a kind gets the bare role name,
/// later ones `_02`, `_03`, ...
pub fn role_folder_names(roles: &[RoleInstance]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    roles
        .iter()
        .map(|r| {
            let name = r.role.name();
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                format!("{}_{:02}", name, count)
            } else {
                name
            }
        })
        .collect()
}

/// Save every role of `session` under `output_dir`
pub async fn save_session_artifacts(
    session: &SessionInstance,
    output_dir: &Path,
) -> Result<Vec<RoleArtifacts>> {
    let roles = session.running_roles();
    let mut artifacts = Vec::with_capacity(roles.len());
    for (role, folder) in roles.iter().zip(role_folder_names(roles)) {
        artifacts.push(save_role_artifacts(role, &output_dir.join(folder)).await?);
    }
    Ok(artifacts)
}

/// Write the role's output log and archive its saved directory
///
/// Editor roles keep their saved data where it is; it can be very large.
pub async fn save_role_artifacts(running: &RoleInstance, dest: &Path) -> Result<RoleArtifacts> {
    fs::create_dir_all(dest)?;
    let role_name = running.role.name();
    let instance = &running.instance;

    let std_out = instance.std_out().await;
    let log_path = dest.join(format!("{}Output.log", role_name));
    let command: Vec<String> = std::env::args().collect();
    let mut log = String::new();
    log.push_str("------ devicelab test ------\n");
    log.push_str(&format!("Role: {}\n", running.role));
    log.push_str(&format!("Device: {}\n", instance.device_name()));
    log.push_str(&format!("Command line: {}\n", instance.command_line()));
    log.push_str(&format!("Invoked as: {}\n", command.join(" ")));
    log.push_str("----------------------------\n");
    log.push_str(&std_out);
    fs::write(&log_path, log)?;
    tracing::info!("Wrote log to {}", log_path.display());

    if running.role.role_type.uses_editor() {
        tracing::info!("Skipping archival of saved data for {}", role_name);
    } else {
        let source = instance.artifact_path().await;
        if source.is_dir() {
            let dest_saved = dest.join("Saved");
            let copied = copy_dir(&source, &dest_saved)?;
            tracing::info!("Archived {} file(s) to {}", copied, dest_saved.display());
        } else {
            tracing::info!("Archive path '{}' was not found", source.display());
        }
    }

    Ok(RoleArtifacts {
        role: running.role.clone(),
        instance: instance.clone(),
        artifact_path: dest.to_path_buf(),
        log_path,
        log_parser: LogParser::new(&std_out),
    })
}

fn copy_dir(source: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(source) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable artifact: {}", e);
                continue;
            }
        };
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{Configuration, Platform, RoleType};
    use crate::session::instance::fake::FakeInstance;
    use crate::session::role::RoleModifier;

    fn running(role: SessionRole, instance: FakeInstance) -> RoleInstance {
        RoleInstance {
            role,
            instance: Arc::new(instance),
        }
    }

    fn client() -> SessionRole {
        SessionRole::new(RoleType::Client, Platform::Android, Configuration::Test)
    }

    #[test]
    fn test_folder_names() {
        let roles = vec![
            running(client(), FakeInstance::new("a")),
            running(client(), FakeInstance::new("b")),
            running(
                SessionRole::new(RoleType::Server, Platform::Linux, Configuration::Test),
                FakeInstance::new("c"),
            ),
            running(client().with_modifier(RoleModifier::Dummy), FakeInstance::new("d")),
        ];
        assert_eq!(
            role_folder_names(&roles),
            vec!["Client", "Client_02", "Server", "DummyClient"]
        );
    }

    #[tokio::test]
    async fn test_saves_output_and_saved_dir() {
        let dir = tempfile::tempdir().unwrap();
        let saved = dir.path().join("device/Saved");
        fs::create_dir_all(saved.join("Logs")).unwrap();
        fs::write(saved.join("Logs/OrionGame.log"), "LogInit: hi").unwrap();

        let mut instance = FakeInstance::new("pixel");
        instance.saved = saved;
        instance.print("LogTemp: Error: bad thing\n*** TEST COMPLETE. EXIT CODE: 0 ***\n");
        let role = running(client(), instance);

        let dest = dir.path().join("out/Client");
        let artifacts = save_role_artifacts(&role, &dest).await.unwrap();

        assert_eq!(artifacts.log_path, dest.join("ClientOutput.log"));
        let log = fs::read_to_string(&artifacts.log_path).unwrap();
        assert!(log.starts_with("------ devicelab test ------"));
        assert!(log.contains("Device: pixel"));
        assert!(log.ends_with("*** TEST COMPLETE. EXIT CODE: 0 ***\n"));
        assert!(dest.join("Saved/Logs/OrionGame.log").is_file());
        assert_eq!(artifacts.log_parser.test_exit_code(), Some(0));
        assert_eq!(artifacts.log_parser.errors(None).len(), 1);
    }

    #[tokio::test]
    async fn test_editor_saved_dir_not_archived() {
        let dir = tempfile::tempdir().unwrap();
        let saved = dir.path().join("Saved");
        fs::create_dir_all(&saved).unwrap();
        fs::write(saved.join("huge.bin"), "x").unwrap();

        let mut instance = FakeInstance::new("localhost");
        instance.saved = saved;
        let role = running(
            SessionRole::new(RoleType::Editor, Platform::Linux, Configuration::Development),
            instance,
        );

        let dest = dir.path().join("out/Editor");
        save_role_artifacts(&role, &dest).await.unwrap();
        assert!(dest.join("EditorOutput.log").is_file());
        assert!(!dest.join("Saved").exists());
    }
}
