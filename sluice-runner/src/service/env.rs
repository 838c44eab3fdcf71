//! Job environment
//!
//! Projects task data and pipeline configuration onto the variable map every
//! job command sees, and decides which of those variables are secrets.

use std::collections::BTreeMap;

use sluice_core::domain::config::{JobConfig, PipelineConfig};
use sluice_core::domain::job::PipelineJob;
use sluice_core::domain::pipeline::RefType;
use sluice_core::domain::task::PipelineRun;

/// Name under which the pipeline's SSH private key is masked
pub const SSH_PRIVATE_KEY_VAR: &str = "SSH_PRIVATE_KEY";

/// Runner-side facts injected into every job
#[derive(Debug, Clone)]
pub struct EnvContext {
    /// Checkout path as seen from inside the job sandbox
    pub project_dir: String,
    /// Credential agent socket as seen from inside the job sandbox
    pub ssh_auth_sock: String,
    pub runner_version: String,
}

/// Builds the environment of one job
///
/// Later sources override earlier ones: pipeline config variables, job
/// config variables, task variables, then the `CI_*` built-ins.
pub fn job_env(
    run: &PipelineRun,
    job: &PipelineJob,
    pipeline_config: &PipelineConfig,
    job_config: &JobConfig,
    ctx: &EnvContext,
) -> BTreeMap<String, String> {
    let pipeline = &run.pipeline;
    let mut env = BTreeMap::new();

    env.extend(pipeline_config.variables.clone());
    env.extend(job_config.variables.clone());
    for var in &run.env {
        env.insert(var.key.clone(), var.value.clone());
    }

    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };

    set("CI", "true".to_string());
    set("CI_PIPELINE_ID", pipeline.id.to_string());
    set("CI_JOB_ID", job.id.to_string());
    set("CI_JOB_NAME", job.name.clone());
    set("CI_JOB_STAGE", job.stage.clone());
    set("CI_COMMIT_SHA", pipeline.commit.clone());
    set("CI_COMMIT_BEFORE_SHA", pipeline.from_commit.clone());
    set("CI_COMMIT_REF_NAME", pipeline.ref_display_id.clone());
    match pipeline.ref_type {
        RefType::Branch => set("CI_COMMIT_BRANCH", pipeline.ref_display_id.clone()),
        RefType::Tag => set("CI_COMMIT_TAG", pipeline.ref_display_id.clone()),
    }
    if let Some(pr) = &pipeline.pull_request {
        set("CI_MERGE_REQUEST_ID", pr.id.to_string());
        set("CI_MERGE_REQUEST_SOURCE_BRANCH_NAME", pr.source_branch.clone());
        set("CI_MERGE_REQUEST_TARGET_BRANCH_NAME", pr.target_branch.clone());
    }
    set("CI_PROJECT_ID", pipeline.project_id.to_string());
    set("CI_PROJECT_NAME", pipeline.project_name.clone());
    set("CI_REPOSITORY_ID", pipeline.repository_id.to_string());
    set("CI_REPOSITORY_URL", run.clone_url.clone());
    set("CI_PROJECT_DIR", ctx.project_dir.clone());
    set("CI_RUNNER_ID", pipeline.runner_id.to_string());
    set("CI_RUNNER_VERSION", ctx.runner_version.clone());
    set("SSH_AUTH_SOCK", ctx.ssh_auth_sock.clone());

    env
}

/// Names of the variables whose values must never reach the job log
pub fn secret_names(run: &PipelineRun) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for var in run.env.iter().filter(|v| v.masked) {
        if !names.contains(&var.key) {
            names.push(var.key.clone());
        }
    }
    if run.ssh_private_key.is_some() {
        names.push(SSH_PRIVATE_KEY_VAR.to_string());
    }
    names
}

/// Resolves a secret name against the job environment and the task
pub fn secret_value(
    run: &PipelineRun,
    env: &BTreeMap<String, String>,
    name: &str,
) -> Option<String> {
    if name == SSH_PRIVATE_KEY_VAR
        && let Some(key) = &run.ssh_private_key
    {
        return Some(key.clone());
    }
    env.get(name).cloned()
}

/// Expands `$VAR` and `${VAR}` references; unknown variables expand to ""
pub fn expand(template: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek().copied() {
            Some((start, '{')) => {
                chars.next();
                let rest = &template[start + 1..];
                match rest.find('}') {
                    Some(end) => {
                        let name = &rest[..end];
                        out.push_str(env.get(name).map(String::as_str).unwrap_or(""));
                        for _ in 0..name.chars().count() + 1 {
                            chars.next();
                        }
                    }
                    None => {
                        // unterminated, keep literally
                        out.push_str("${");
                    }
                }
            }
            Some((start, n)) if n == '_' || n.is_ascii_alphabetic() => {
                let name_len = template[start..]
                    .find(|ch: char| !(ch == '_' || ch.is_ascii_alphanumeric()))
                    .unwrap_or(template.len() - start);
                let name = &template[start..start + name_len];
                out.push_str(env.get(name).map(String::as_str).unwrap_or(""));
                for _ in 0..name_len {
                    chars.next();
                }
            }
            _ => out.push('$'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::domain::pipeline::{Pipeline, PullRequest, Variable};
    use sluice_core::domain::status::Status;
    use uuid::Uuid;

    fn sample_run() -> PipelineRun {
        PipelineRun {
            pipeline: Pipeline {
                id: Uuid::new_v4(),
                commit: "c0ffee".to_string(),
                from_commit: "beef".to_string(),
                ref_type: RefType::Branch,
                ref_display_id: "main".to_string(),
                pull_request: None,
                runner_id: Uuid::new_v4(),
                repository_id: Uuid::new_v4(),
                project_id: Uuid::new_v4(),
                project_name: "demo".to_string(),
                clone_url: "https://git.example.com/demo.git".to_string(),
                ssh_clone_url: "git@git.example.com:demo.git".to_string(),
                config_file: ".sluice.yml".to_string(),
            },
            jobs: Vec::new(),
            env: vec![
                Variable {
                    key: "SHARED".to_string(),
                    value: "from-task".to_string(),
                    masked: false,
                },
                Variable {
                    key: "API_TOKEN".to_string(),
                    value: "s3cret".to_string(),
                    masked: true,
                },
            ],
            clone_url: "git@git.example.com:demo.git".to_string(),
            known_hosts: String::new(),
            ssh_private_key: Some("-----BEGIN KEY-----\nabc\n-----END KEY-----".to_string()),
        }
    }

    fn ctx() -> EnvContext {
        EnvContext {
            project_dir: "/ci/src".to_string(),
            ssh_auth_sock: "/ci/ssh/agent.sock".to_string(),
            runner_version: "0.1.0".to_string(),
        }
    }

    fn job() -> PipelineJob {
        PipelineJob {
            id: Uuid::new_v4(),
            stage: "build".to_string(),
            name: "compile".to_string(),
            status: Status::Pending,
        }
    }

    #[test]
    fn test_variable_precedence() {
        let run = sample_run();
        let mut pipeline_config = PipelineConfig::default();
        pipeline_config
            .variables
            .insert("SHARED".to_string(), "from-pipeline".to_string());
        pipeline_config
            .variables
            .insert("ONLY_PIPELINE".to_string(), "p".to_string());
        let mut job_config = JobConfig::default();
        job_config
            .variables
            .insert("ONLY_PIPELINE".to_string(), "j".to_string());
        job_config
            .variables
            .insert("CI".to_string(), "overridden".to_string());

        let env = job_env(&run, &job(), &pipeline_config, &job_config, &ctx());

        assert_eq!(env["SHARED"], "from-task");
        assert_eq!(env["ONLY_PIPELINE"], "j");
        assert_eq!(env["CI"], "true", "built-ins win");
        assert_eq!(env["CI_COMMIT_BRANCH"], "main");
        assert!(!env.contains_key("CI_COMMIT_TAG"));
        assert_eq!(env["CI_JOB_STAGE"], "build");
        assert_eq!(env["SSH_AUTH_SOCK"], "/ci/ssh/agent.sock");
    }

    #[test]
    fn test_tag_and_pull_request_variables() {
        let mut run = sample_run();
        run.pipeline.ref_type = RefType::Tag;
        run.pipeline.ref_display_id = "v1.2.0".to_string();
        run.pipeline.pull_request = Some(PullRequest {
            id: 42,
            title: "Add thing".to_string(),
            source_branch: "feature".to_string(),
            target_branch: "main".to_string(),
        });

        let env = job_env(
            &run,
            &job(),
            &PipelineConfig::default(),
            &JobConfig::default(),
            &ctx(),
        );

        assert_eq!(env["CI_COMMIT_TAG"], "v1.2.0");
        assert!(!env.contains_key("CI_COMMIT_BRANCH"));
        assert_eq!(env["CI_MERGE_REQUEST_ID"], "42");
        assert_eq!(env["CI_MERGE_REQUEST_SOURCE_BRANCH_NAME"], "feature");
    }

    #[test]
    fn test_secret_names_and_values() {
        let run = sample_run();
        let names = secret_names(&run);
        assert_eq!(names, vec!["API_TOKEN".to_string(), SSH_PRIVATE_KEY_VAR.to_string()]);

        let env = job_env(
            &run,
            &job(),
            &PipelineConfig::default(),
            &JobConfig::default(),
            &ctx(),
        );
        assert_eq!(secret_value(&run, &env, "API_TOKEN").as_deref(), Some("s3cret"));
        assert!(
            secret_value(&run, &env, SSH_PRIVATE_KEY_VAR)
                .unwrap()
                .contains("BEGIN KEY")
        );
    }

    #[test]
    fn test_expand() {
        let mut env = BTreeMap::new();
        env.insert("REGISTRY".to_string(), "ghcr.io".to_string());
        env.insert("TAG".to_string(), "1.0".to_string());

        assert_eq!(expand("${REGISTRY}/app:$TAG", &env), "ghcr.io/app:1.0");
        assert_eq!(expand("img:${MISSING}x", &env), "img:x");
        assert_eq!(expand("$MISSING-suffix", &env), "-suffix");
        assert_eq!(expand("cost $5 and ${open", &env), "cost $5 and ${open");
        assert_eq!(expand("plain", &env), "plain");
    }
}
