//! Per-platform validation of test entries.
//!
//! Every check appends a `Test <platform>: <problem>` line; the loader
//! reports all lines together so a broken buildspec is fixed in one pass.

use std::collections::HashMap;
use std::path::Path;

use crate::buildspec::template::Template;
use crate::plan::{PlatformFamily, TestEntry};

/// Placeholders available to every manifest in addition to entry params.
pub const RUNTIME_PLACEHOLDERS: &[&str] = &[
    "image_uri",
    "framework",
    "region",
    "account_id",
    "arch_type",
    "run_id",
    "entry_id",
];

/// Manifest paths declared by an entry (`manifest` or `manifests`).
pub fn manifest_paths(entry: &TestEntry) -> Vec<String> {
    let mut paths = entry.params.string_list("manifest");
    paths.extend(entry.params.string_list("manifests"));
    paths
}

/// Validates every entry and the parallel groups between them.
pub fn validate_entries(entries: &[TestEntry], repo_root: &Path) -> Vec<String> {
    let mut errors = Vec::new();
    for entry in entries {
        validate_entry(entry, repo_root, &mut errors);
    }
    validate_parallel_groups(entries, &mut errors);
    errors
}

fn validate_entry(entry: &TestEntry, repo_root: &Path, errors: &mut Vec<String>) {
    let mut fail = |problem: String| errors.push(format!("Test {}: {}", entry.platform, problem));

    if entry.run.is_empty() {
        fail("'run' must list at least one command".to_string());
    }

    if entry.params.contains("node_count") && !entry.params.u64("node_count").is_some_and(|n| n > 0) {
        fail("param 'node_count' must be a positive integer".to_string());
    }

    for command in &entry.run {
        if let Some(path) = referenced_test_file(command)
            && !repo_root.join(&path).exists()
        {
            fail(format!("command references missing file '{}'", path));
        }
    }

    let required: &[&str] = match entry.platform.family {
        PlatformFamily::Vm => &["instance_type"],
        PlatformFamily::Kubernetes => &["cluster", "namespace"],
        PlatformFamily::ContainerCluster => {
            let fargate = entry
                .params
                .str("launch_type")
                .is_some_and(|t| t.eq_ignore_ascii_case("fargate"));
            if fargate { &[] } else { &["instance_type"] }
        }
    };
    for key in required {
        if entry.params.render(key).is_none_or(|v| v.is_empty()) {
            fail(format!("missing required param '{}'", key));
        }
    }

    if entry.platform.family == PlatformFamily::Kubernetes {
        for manifest in manifest_paths(entry) {
            if let Err(problem) = check_manifest(entry, repo_root, &manifest) {
                fail(problem);
            }
        }
    }

    if entry.platform.family == PlatformFamily::ContainerCluster
        && let Some(launch) = entry.params.str("launch_type")
        && !matches!(launch.to_ascii_uppercase().as_str(), "EC2" | "FARGATE")
    {
        fail(format!("unknown launch_type '{}'", launch));
    }
}

/// The `test/...` path passed as the second word of a command, if any.
fn referenced_test_file(command: &str) -> Option<String> {
    let words = shell_words::split(command).ok()?;
    let second = words.get(1)?;
    second.starts_with("test/").then(|| second.clone())
}

fn check_manifest(entry: &TestEntry, repo_root: &Path, manifest: &str) -> Result<(), String> {
    let path = repo_root.join(manifest);
    let source = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read manifest '{}': {}", manifest, e))?;
    let template =
        Template::parse(&source).map_err(|e| format!("manifest '{}': {}", manifest, e))?;

    let known = entry
        .params
        .keys()
        .chain(RUNTIME_PLACEHOLDERS.iter().copied());
    template
        .check(known)
        .map_err(|e| format!("manifest '{}': {}", manifest, e))
}

/// Entries of one parallel group must not share a cluster (and namespace).
fn validate_parallel_groups(entries: &[TestEntry], errors: &mut Vec<String>) {
    let mut claimed: HashMap<(String, String), &TestEntry> = HashMap::new();

    for entry in entries {
        let (Some(group), Some(key)) = (&entry.parallel_group, shared_resource_key(entry)) else {
            continue;
        };
        match claimed.get(&(group.clone(), key.clone())) {
            Some(first) => errors.push(format!(
                "Test {}: parallel_group '{}' shares {} with {}",
                entry.platform, group, key, first.id
            )),
            None => {
                claimed.insert((group.clone(), key), entry);
            }
        }
    }
}

/// The named cloud resource an entry would share with others, if any.
pub fn shared_resource_key(entry: &TestEntry) -> Option<String> {
    let cluster = entry.params.str("cluster")?;
    match entry.platform.family {
        PlatformFamily::Kubernetes => Some(format!(
            "cluster '{}' namespace '{}'",
            cluster,
            entry.params.str("namespace").unwrap_or("default")
        )),
        PlatformFamily::ContainerCluster => Some(format!("cluster '{}'", cluster)),
        PlatformFamily::Vm => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Params, Platform, Selectors};
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(platform: &str, params: serde_json::Value, run: &[&str]) -> TestEntry {
        let params: Params = serde_json::from_value(params).unwrap();
        TestEntry {
            id: format!("img/0-{}", platform),
            image_name: "img".into(),
            index: 0,
            platform: Platform::parse(platform).unwrap(),
            params,
            run: run.iter().map(|s| s.to_string()).collect(),
            data_source: None,
            selectors: Selectors::default(),
            parallel_group: None,
        }
    }

    #[test]
    fn test_missing_instance_type() {
        let errors = validate_entries(&[entry("vm-gpu", json!({}), &["true"])], Path::new("/"));
        assert_eq!(errors, vec!["Test vm-gpu: missing required param 'instance_type'"]);
    }

    #[test]
    fn test_kubernetes_requires_cluster_and_namespace() {
        let errors = validate_entries(
            &[entry("kube-gpu", json!({"cluster": "dlc-pr"}), &["true"])],
            Path::new("/"),
        );
        assert_eq!(errors, vec!["Test kube-gpu: missing required param 'namespace'"]);
    }

    #[test]
    fn test_fargate_needs_no_instance_type() {
        let errors = validate_entries(
            &[
                entry("ecs-cpu", json!({"launch_type": "FARGATE"}), &["GET /ping"]),
                entry("ecs-gpu", json!({}), &["GET /ping"]),
            ],
            Path::new("/"),
        );
        assert_eq!(errors, vec!["Test ecs-gpu: missing required param 'instance_type'"]);
    }

    #[test]
    fn test_common_checks() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("test/vm")).unwrap();
        std::fs::write(dir.path().join("test/vm/smoke.sh"), "").unwrap();

        let errors = validate_entries(
            &[
                entry(
                    "vm-cpu",
                    json!({"instance_type": "c5.9xlarge", "node_count": 0}),
                    &["bash test/vm/smoke.sh", "bash test/vm/missing.sh"],
                ),
                entry("vm-cpu", json!({"instance_type": "c5.9xlarge"}), &[]),
            ],
            dir.path(),
        );
        assert_eq!(
            errors,
            vec![
                "Test vm-cpu: param 'node_count' must be a positive integer",
                "Test vm-cpu: command references missing file 'test/vm/missing.sh'",
                "Test vm-cpu: 'run' must list at least one command",
            ]
        );
    }

    #[test]
    fn test_manifest_placeholders_checked() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("ok.yaml"),
            "image: {{ image_uri }}\nnamespace: {{ namespace }}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "token: {{ hf_token }}\n").unwrap();

        let errors = validate_entries(
            &[entry(
                "kube-gpu",
                json!({"cluster": "c", "namespace": "n", "manifests": ["ok.yaml", "bad.yaml"]}),
                &["true"],
            )],
            dir.path(),
        );
        assert_eq!(
            errors,
            vec!["Test kube-gpu: manifest 'bad.yaml': unknown placeholder 'hf_token'"]
        );
    }

    #[test]
    fn test_parallel_group_disjointness() {
        let mut a = entry("kube-gpu", json!({"cluster": "c", "namespace": "n"}), &["true"]);
        let mut b = entry("kube-cpu", json!({"cluster": "c", "namespace": "n"}), &["true"]);
        let mut c = entry("kube-cpu", json!({"cluster": "c", "namespace": "m"}), &["true"]);
        for e in [&mut a, &mut b, &mut c] {
            e.parallel_group = Some("g".into());
        }

        let errors = validate_entries(&[a, b, c], Path::new("/"));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Test kube-cpu: parallel_group 'g' shares cluster 'c' namespace 'n'"));
    }
}
