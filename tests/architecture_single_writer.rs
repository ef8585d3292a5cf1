use std::fs;
use std::path::{Path, PathBuf};

const STATE_WRITER_DIR: &str = "src/engine/";

const LOWER_LAYERS: &[&str] = &["src/domain/", "src/adapters/", "src/services/"];

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

fn source_files() -> Vec<(String, String)> {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    collect_rust_files(&repo_root.join("src"), &mut files);
    files
        .into_iter()
        .map(|file| {
            let rel = file
                .strip_prefix(repo_root)
                .unwrap_or(&file)
                .to_string_lossy()
                .replace('\\', "/");
            let content = fs::read_to_string(&file).unwrap_or_default();
            (rel, content)
        })
        .collect()
}

#[test]
fn reconciliation_state_is_only_mutated_by_the_engine() {
    let mut offenders = Vec::new();
    for (rel, content) in source_files() {
        if rel.starts_with(STATE_WRITER_DIR) {
            continue;
        }
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.contains(".apply_event(") || trimmed.contains("ReconciliationState::new(") {
                offenders.push(format!("{rel}:{}: {}", idx + 1, trimmed));
            }
        }
    }

    assert!(
        offenders.is_empty(),
        "reconciliation state touched outside the engine task:\n{}",
        offenders.join("\n")
    );
}

#[test]
fn lower_layers_do_not_reach_into_the_engine() {
    let mut offenders = Vec::new();
    for (rel, content) in source_files() {
        if !LOWER_LAYERS.iter().any(|layer| rel.starts_with(layer)) {
            continue;
        }
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.contains("crate::engine") {
                offenders.push(format!("{rel}:{}: {}", idx + 1, trimmed));
            }
        }
    }

    assert!(
        offenders.is_empty(),
        "domain/adapters/services must not depend on the engine:\n{}",
        offenders.join("\n")
    );
}
