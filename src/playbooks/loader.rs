use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::models::Playbook;

/// On-disk encodings accepted for playbook definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybookFormat {
    Yaml,
    Json,
}

impl PlaybookFormat {
    /// Guess the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(PlaybookFormat::Yaml),
            "json" => Some(PlaybookFormat::Json),
            _ => None,
        }
    }
}

/// Parse a playbook definition
pub fn parse_playbook(content: &str, format: PlaybookFormat) -> Result<Playbook> {
    let playbook = match format {
        PlaybookFormat::Yaml => serde_yaml::from_str(content)?,
        PlaybookFormat::Json => serde_json::from_str(content)?,
    };
    Ok(playbook)
}

/// Read a playbook from a `.yaml`, `.yml` or `.json` file
pub fn load_playbook_file(path: impl AsRef<Path>) -> Result<Playbook> {
    let path = path.as_ref();
    let format = PlaybookFormat::from_path(path).ok_or_else(|| {
        AppError::Validation(format!(
            "unsupported playbook file {:?}; expected .yaml, .yml or .json",
            path
        ))
    })?;

    let content = fs::read_to_string(path)?;
    parse_playbook(&content, format).map_err(|e| match e {
        AppError::Serialization(msg) => {
            AppError::Serialization(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

/// Read every playbook in a directory, sorted by file name.
///
/// Files with other extensions are ignored; a file that fails to parse fails the whole load.
pub fn load_playbook_dir(dir: impl AsRef<Path>) -> Result<Vec<Playbook>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(AppError::NotFound(format!(
            "playbook directory {:?} does not exist",
            dir
        )));
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && PlaybookFormat::from_path(&path).is_some() {
            paths.push(path);
        } else {
            debug!(path = ?path, "Ignoring non-playbook entry");
        }
    }
    paths.sort();

    let mut playbooks = Vec::with_capacity(paths.len());
    for path in paths {
        let playbook = load_playbook_file(&path)?;
        if playbooks.iter().any(|p: &Playbook| p.id == playbook.id && p.version == playbook.version) {
            warn!(path = ?path, playbook_id = %playbook.id, "Duplicate playbook version in directory");
        }
        playbooks.push(playbook);
    }

    Ok(playbooks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionType;
    use tempfile::TempDir;

    const CONTAINMENT: &str = r#"
name: Host Containment
version: "3"
actions:
  - id: isolate
    action_type: isolate_endpoint
    order: 1
    parameters:
      host: "{{hostname}}"
"#;

    #[test]
    fn test_parse_yaml_defaults_id() {
        let playbook = parse_playbook(CONTAINMENT, PlaybookFormat::Yaml).unwrap();
        assert_eq!(playbook.version, "3");
        assert_eq!(playbook.actions[0].action_type, ActionType::IsolateEndpoint);
        assert!(!playbook.id.is_nil());
    }

    #[test]
    fn test_load_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b_contain.yaml"), CONTAINMENT).unwrap();

        let json = serde_json::json!({
            "name": "Notify",
            "actions": [{
                "id": "page",
                "action_type": "send_notification",
                "order": 1,
                "parameters": {"channel": "#soc", "message": "alert"}
            }]
        });
        fs::write(dir.path().join("a_notify.json"), json.to_string()).unwrap();
        fs::write(dir.path().join("README.md"), "not a playbook").unwrap();

        let playbooks = load_playbook_dir(dir.path()).unwrap();
        let names: Vec<_> = playbooks.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Notify", "Host Containment"]);
        assert_eq!(playbooks[0].version, "1.0.0");
    }

    #[test]
    fn test_rejects_unknown_extension_and_bad_content() {
        let dir = TempDir::new().unwrap();
        let txt = dir.path().join("playbook.txt");
        fs::write(&txt, CONTAINMENT).unwrap();
        assert!(matches!(load_playbook_file(&txt), Err(AppError::Validation(_))));

        let broken = dir.path().join("broken.yaml");
        fs::write(&broken, "name: [unterminated").unwrap();
        let err = load_playbook_file(&broken).unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn test_missing_directory() {
        assert!(load_playbook_dir("/definitely/not/here").is_err());
    }
}
