use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::Path;

use regex::Regex;

use crate::executor::request::Request;

/// Merges the environment the experiment script will see: the agent's own
/// environment, the request's env bag, and the allocation's device pinning,
/// in that order.  `%NAME%` markers inside request values are substituted
/// against the process environment; unknown names are left untouched.
pub fn merge_env(
    process_env: &HashMap<String, String>,
    request: &Request,
    alloc_env: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();

    for (name, value) in process_env {
        // Only names an export statement can carry survive the merge
        let leading = name.chars().next().unwrap_or('_');
        if !leading.is_alphanumeric() {
            if leading != '_' {
                log::debug!("env var {name} dropped due to conformance");
            }
            continue;
        }
        merged.insert(name.clone(), value.replace('"', "\\\""));
    }

    let marker = Regex::new(r"%([A-Za-z0-9_]+)%").unwrap();
    for (name, value) in &request.config.env {
        let mut resolved = value.clone();
        for captures in marker.captures_iter(value) {
            let reference = captures.get(1).unwrap().as_str();
            if let Some(substitute) = process_env.get(reference) {
                resolved = resolved.replace(&captures[0], substitute);
            }
        }
        merged.insert(name.clone(), resolved.replace('"', "\\\""));
    }

    // Credentials forwarded through env need the SDK to honor config files
    merged.insert("AWS_SDK_LOAD_CONFIG".to_string(), "1".to_string());

    for (name, value) in alloc_env {
        merged.insert(name.clone(), value.clone());
    }

    merged
}

/// Synthesizes the shell script that prepares an isolated python environment
/// and runs the experiment's entry point.
pub fn make_script(
    request: &Request,
    root_dir: &Path,
    expr_dir: &Path,
    expr_sub_dir: &str,
    envs: &BTreeMap<String, String>,
) -> String {
    let mut script = String::new();
    script.push_str("#!/bin/bash -x\n");
    script.push_str("date\n");

    for (name, value) in envs {
        let _ = writeln!(script, "export {name}=\"{value}\"");
    }
    script.push_str(
        "export LD_LIBRARY_PATH=$LD_LIBRARY_PATH:/usr/local/cuda/lib64/:/usr/lib/x86_64-linux-gnu:/lib/x86_64-linux-gnu/\n",
    );

    let root = root_dir.display();
    let _ = writeln!(script, "mkdir -p {root}/blob-cache");
    let _ = writeln!(script, "mkdir -p {root}/queue");
    let _ = writeln!(
        script,
        "mkdir -p {root}/artifact-mappings/{}",
        request.experiment.key
    );
    let _ = writeln!(script, "cd {}/workspace", expr_dir.display());
    script.push_str("virtualenv --system-site-packages -p python3 .\n");
    script.push_str("source bin/activate\n");

    if !request.config.pip.is_empty() {
        let _ = writeln!(script, "pip install {}", request.config.pip.join(" "));
    }
    for package in &request.experiment.pythonenv {
        // The client bundles its own studioml pin, handled below
        if package != "studioml==" {
            let _ = writeln!(script, "pip install {package}");
        }
    }
    script.push_str(concat!(
        "if [ \"`echo dist/studioml-*.tar.gz`\" != \"dist/studioml-*.tar.gz\" ]; then\n",
        "    pip install dist/studioml-*.tar.gz\n",
        "else\n",
        "    pip install studioml\n",
        "fi\n",
    ));

    let _ = writeln!(script, "export STUDIOML_EXPERIMENT={expr_sub_dir}");
    let _ = writeln!(script, "export STUDIOML_HOME={root}");
    let _ = writeln!(
        script,
        "python {} {}",
        request.experiment.filename,
        request.experiment.args.join(" ")
    );
    script.push_str("deactivate\n");
    script.push_str("date\n");
    script
}

/// Writes the script with owner-executable permissions.
pub fn write_script(path: &Path, content: &str) -> crate::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, content)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o744))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::request::Request;

    fn request_with_env(env: &[(&str, &str)]) -> Request {
        let mut request =
            Request::unmarshal(br#"{"config": {}, "experiment": {"key": "k"}}"#).unwrap();
        for (name, value) in env {
            request
                .config
                .env
                .insert(name.to_string(), value.to_string());
        }
        request
    }

    #[test]
    fn test_marker_substitution() {
        let process_env: HashMap<String, String> = [
            ("HOME".to_string(), "/home/worker".to_string()),
            ("REGION".to_string(), "us-west-2".to_string()),
        ]
        .into();
        let request = request_with_env(&[
            ("DATA_DIR", "%HOME%/data"),
            ("COMPOUND", "%REGION%-%UNKNOWN%"),
        ]);

        let merged = merge_env(&process_env, &request, &HashMap::new());
        assert_eq!(merged["DATA_DIR"], "/home/worker/data");
        // Markers without a process env counterpart stay verbatim
        assert_eq!(merged["COMPOUND"], "us-west-2-%UNKNOWN%");
        assert_eq!(merged["AWS_SDK_LOAD_CONFIG"], "1");
    }

    #[test]
    fn test_nonconforming_names_are_dropped() {
        let process_env: HashMap<String, String> = [
            ("GOOD".to_string(), "1".to_string()),
            ("_".to_string(), "/cwd".to_string()),
            ("=weird".to_string(), "x".to_string()),
        ]
        .into();
        let request = request_with_env(&[]);

        let merged = merge_env(&process_env, &request, &HashMap::new());
        assert!(merged.contains_key("GOOD"));
        assert!(!merged.contains_key("_"));
        assert!(!merged.contains_key("=weird"));
    }

    #[test]
    fn test_allocation_env_wins() {
        let process_env: HashMap<String, String> =
            [("CUDA_VISIBLE_DEVICES".to_string(), "7".to_string())].into();
        let alloc_env: HashMap<String, String> =
            [("CUDA_VISIBLE_DEVICES".to_string(), "2".to_string())].into();
        let request = request_with_env(&[]);

        let merged = merge_env(&process_env, &request, &alloc_env);
        assert_eq!(merged["CUDA_VISIBLE_DEVICES"], "2");
    }

    #[test]
    fn test_script_shape() {
        let request = Request::unmarshal(
            r#"{
                "config": {"pip": ["keras==2.0"]},
                "experiment": {
                    "key": "exp-1",
                    "filename": "train.py",
                    "args": ["--epochs", "3"],
                    "pythonenv": ["numpy==1.14", "studioml=="]
                }
            }"#
            .as_bytes(),
        )
        .unwrap();
        let envs: BTreeMap<String, String> =
            [("STUDIO_SECRET".to_string(), "s".to_string())].into();

        let script = make_script(
            &request,
            Path::new("/work"),
            Path::new("/work/experiments/ab.0"),
            "ab.0",
            &envs,
        );

        assert!(script.starts_with("#!/bin/bash -x\n"));
        assert!(script.contains("export STUDIO_SECRET=\"s\""));
        assert!(script.contains("cd /work/experiments/ab.0/workspace"));
        assert!(script.contains("pip install keras==2.0"));
        assert!(script.contains("pip install numpy==1.14"));
        assert!(!script.contains("pip install studioml==\n"));
        assert!(script.contains("export STUDIOML_EXPERIMENT=ab.0"));
        assert!(script.contains("export STUDIOML_HOME=/work"));
        assert!(script.contains("python train.py --epochs 3"));
    }
}
