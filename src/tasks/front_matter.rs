//! Markdown-with-front-matter parsing for task files.
//!
//! The front matter is the leading block between two `---` lines; the body
//! is everything after. Parsing keeps the raw mapping in source key order
//! so a rewrite preserves ordering and passes unknown keys through
//! untouched.

use crate::models::{Completion, Priority, Task, TaskStatus};
use crate::{Result, TanukiError};
use serde_yaml::{Mapping, Value};
use std::path::Path;

/// Split a raw task file into its front-matter mapping and body.
pub fn split(raw: &str) -> Result<(Mapping, String)> {
    let mut lines = raw.split_inclusive('\n');
    let first = lines
        .next()
        .filter(|line| line.trim_end() == "---")
        .ok_or_else(|| TanukiError::invalid("front matter", "file must start with ---"))?;

    let mut offset = first.len();
    let mut yaml_end = None;
    for line in lines {
        if line.trim_end() == "---" {
            yaml_end = Some(offset);
            offset += line.len();
            break;
        }
        offset += line.len();
    }
    let yaml_end = yaml_end
        .ok_or_else(|| TanukiError::invalid("front matter", "missing closing --- delimiter"))?;

    let yaml_src = &raw[first.len()..yaml_end];
    let mapping: Mapping = if yaml_src.trim().is_empty() {
        Mapping::new()
    } else {
        serde_yaml::from_str(yaml_src)?
    };
    Ok((mapping, raw[offset..].to_string()))
}

/// Render a front-matter mapping and body back into file form.
pub fn render(mapping: &Mapping, body: &str) -> Result<String> {
    let yaml = serde_yaml::to_string(mapping)?;
    Ok(format!("---\n{yaml}---\n{body}"))
}

fn get_str(mapping: &Mapping, key: &str) -> Option<String> {
    mapping
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn get_str_list(mapping: &Mapping, key: &str) -> Result<Vec<String>> {
    match mapping.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    TanukiError::invalid("front matter", format!("{key} entries must be strings"))
                })
            })
            .collect(),
        Some(_) => Err(TanukiError::invalid(
            "front matter",
            format!("{key} must be a list of strings"),
        )),
    }
}

fn get_completion(mapping: &Mapping) -> Result<Option<Completion>> {
    match mapping.get("completion") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Mapping(inner)) => Ok(Some(Completion {
            verify: get_str(inner, "verify"),
            signal: get_str(inner, "signal"),
        })),
        Some(_) => Err(TanukiError::invalid(
            "front matter",
            "completion must be a mapping with verify/signal keys",
        )),
    }
}

/// Parse one task file. `project_hint` is the parent folder name; an
/// explicit `project` key in the front matter wins over it.
pub fn parse_task(path: &Path, project_hint: &str, raw: &str) -> Result<Task> {
    let (mapping, content) = split(raw)?;

    let id = get_str(&mapping, "id").ok_or_else(|| {
        TanukiError::invalid(
            "front matter",
            format!("{}: missing required id", path.display()),
        )
    })?;

    let priority = match get_str(&mapping, "priority") {
        Some(raw) => raw
            .parse::<Priority>()
            .map_err(|e| TanukiError::invalid("front matter", format!("{}: {e}", path.display())))?,
        None => Priority::default(),
    };
    let status = match get_str(&mapping, "status") {
        Some(raw) => raw
            .parse::<TaskStatus>()
            .map_err(|e| TanukiError::invalid("front matter", format!("{}: {e}", path.display())))?,
        None => TaskStatus::Pending,
    };

    Ok(Task {
        id,
        title: get_str(&mapping, "title").unwrap_or_default(),
        project: get_str(&mapping, "project").unwrap_or_else(|| project_hint.to_string()),
        role: get_str(&mapping, "role").unwrap_or_default(),
        workstream: get_str(&mapping, "workstream").unwrap_or_else(|| "main".to_string()),
        priority,
        status,
        depends_on: get_str_list(&mapping, "depends_on")?,
        assigned_to: get_str(&mapping, "assigned_to"),
        completion: get_completion(&mapping)?,
        content,
        path: path.to_path_buf(),
        front_matter: mapping,
    })
}

/// Render a task back into file form, updating the mutable keys in its
/// original front matter so source order and unknown keys survive.
pub fn render_task(task: &Task) -> Result<String> {
    let mut mapping = task.front_matter.clone();
    mapping.insert(
        Value::String("status".to_string()),
        Value::String(task.status.as_str().to_string()),
    );
    match &task.assigned_to {
        Some(agent) => {
            mapping.insert(
                Value::String("assigned_to".to_string()),
                Value::String(agent.clone()),
            );
        }
        None => {
            // Clear rather than remove so key order is untouched.
            if mapping.contains_key("assigned_to") {
                mapping.insert(
                    Value::String("assigned_to".to_string()),
                    Value::String(String::new()),
                );
            }
        }
    }
    render(&mapping, &task.content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SAMPLE: &str = "---\n\
id: auth-001\n\
title: Add login endpoint\n\
role: backend\n\
workstream: auth\n\
priority: high\n\
status: pending\n\
depends_on: [db-001, db-002]\n\
completion:\n\
\x20\x20verify: cargo test -p auth\n\
\x20\x20signal: LOGIN DONE\n\
custom_key: kept as-is\n\
---\n\
\n\
Implement the login endpoint.\n";

    #[test]
    fn parses_all_known_keys() {
        let task = parse_task(&PathBuf::from("t.md"), "webapp", SAMPLE).unwrap();
        assert_eq!(task.id, "auth-001");
        assert_eq!(task.title, "Add login endpoint");
        assert_eq!(task.project, "webapp");
        assert_eq!(task.role, "backend");
        assert_eq!(task.workstream, "auth");
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.depends_on, vec!["db-001", "db-002"]);
        let completion = task.completion.unwrap();
        assert_eq!(completion.verify.as_deref(), Some("cargo test -p auth"));
        assert_eq!(completion.signal.as_deref(), Some("LOGIN DONE"));
        assert!(task.content.contains("Implement the login endpoint."));
    }

    #[test]
    fn explicit_project_key_wins_over_folder() {
        let raw = "---\nid: x-1\nproject: other\n---\nbody\n";
        let task = parse_task(&PathBuf::from("t.md"), "webapp", raw).unwrap();
        assert_eq!(task.project, "other");
    }

    #[test]
    fn workstream_defaults_to_main() {
        let raw = "---\nid: x-1\n---\nbody\n";
        let task = parse_task(&PathBuf::from("t.md"), "", raw).unwrap();
        assert_eq!(task.workstream, "main");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::Medium);
    }

    #[test]
    fn missing_id_is_an_error() {
        let raw = "---\ntitle: no id\n---\nbody\n";
        assert!(parse_task(&PathBuf::from("t.md"), "", raw).is_err());
    }

    #[test]
    fn unknown_status_is_an_error() {
        let raw = "---\nid: x-1\nstatus: paused\n---\nbody\n";
        assert!(parse_task(&PathBuf::from("t.md"), "", raw).is_err());
    }

    #[test]
    fn missing_front_matter_is_an_error() {
        assert!(split("no front matter here\n").is_err());
        assert!(split("---\nid: x\nno closing\n").is_err());
    }

    #[test]
    fn round_trip_preserves_key_order_and_unknown_keys() {
        let task = parse_task(&PathBuf::from("t.md"), "webapp", SAMPLE).unwrap();
        let rendered = render_task(&task).unwrap();

        let reparsed = parse_task(&PathBuf::from("t.md"), "webapp", &rendered).unwrap();
        assert_eq!(reparsed.id, task.id);
        assert_eq!(reparsed.status, task.status);
        assert_eq!(reparsed.priority, task.priority);
        assert_eq!(reparsed.depends_on, task.depends_on);
        assert_eq!(reparsed.content, task.content);

        let original_keys: Vec<String> = task
            .front_matter
            .iter()
            .map(|(k, _)| k.as_str().unwrap().to_string())
            .collect();
        let rendered_keys: Vec<String> = reparsed
            .front_matter
            .iter()
            .map(|(k, _)| k.as_str().unwrap().to_string())
            .collect();
        assert_eq!(original_keys, rendered_keys);
        assert!(rendered.contains("custom_key"));
    }

    #[test]
    fn mutated_status_is_updated_in_place() {
        let mut task = parse_task(&PathBuf::from("t.md"), "webapp", SAMPLE).unwrap();
        task.status = TaskStatus::Complete;
        task.assigned_to = None;
        let rendered = render_task(&task).unwrap();
        let reparsed = parse_task(&PathBuf::from("t.md"), "webapp", &rendered).unwrap();
        assert_eq!(reparsed.status, TaskStatus::Complete);

        // status stays where it was in the original key order
        let keys: Vec<String> = reparsed
            .front_matter
            .iter()
            .map(|(k, _)| k.as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys.iter().position(|k| k == "status"), Some(5));
    }
}
