use anyhow::{bail, Context, Result};
use runbox_common::config::QueueSettings;
use runbox_common::redis::submit_and_wait;
use runbox_common::types::{ExecutionResult, JobEnvelope, RunFile, RunRequest};
use runbox_sandbox::{BackendKind, LanguageProfiles, SandboxExecutor, SandboxSettings};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::RunArgs;

const REPLY_SLACK: Duration = Duration::from_secs(30);

/// clap value parser for `KEY=VALUE`
pub fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

fn load_file(path: &Path) -> Result<RunFile> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(RunFile::new(name, content))
}

pub fn build_request(args: &RunArgs) -> Result<RunRequest> {
    let files = args.files.iter().map(|path| load_file(path)).collect::<Result<Vec<_>>>()?;

    let mut request = RunRequest::new(args.language.clone(), files);
    request.build_cmd = args.build.clone();
    request.run_cmd = args.run_cmd.clone();
    request.env.extend(args.env.iter().cloned());
    Ok(request)
}

fn print_result(result: &ExecutionResult) -> Result<()> {
    let mut stdout = std::io::stdout();
    stdout.write_all(result.stdout.as_bytes())?;
    stdout.flush()?;

    let mut stderr = std::io::stderr();
    stderr.write_all(result.stderr.as_bytes())?;
    stderr.flush()?;
    Ok(())
}

/// Execute in-process and return the run's exit code.
pub async fn run_local(args: &RunArgs, backend: Option<&str>, timeout: Option<u64>) -> Result<i32> {
    let mut settings = SandboxSettings::from_env()?;
    if let Some(backend) = backend {
        settings.backend = backend.parse::<BackendKind>().map_err(anyhow::Error::msg)?;
    }
    if let Some(secs) = timeout {
        settings.timeout = Duration::from_secs(secs);
    }

    let request = build_request(args)?;
    let executor = SandboxExecutor::from_settings(&settings).context("failed to initialize sandbox backend")?;
    let result = executor.run(&request).await;

    print_result(&result)?;
    Ok(result.exit_code)
}

/// Enqueue for a worker and return the reported exit code.
pub async fn submit(args: &RunArgs, wait: Option<u64>) -> Result<i32> {
    let queue = QueueSettings::from_env()?;
    let sandbox = SandboxSettings::from_env()?;
    let reply_timeout = match wait {
        Some(secs) => Duration::from_secs(secs),
        None => queue.reply_timeout.unwrap_or(sandbox.timeout + REPLY_SLACK),
    };

    let job = JobEnvelope {
        id: Uuid::new_v4(),
        request: build_request(args)?,
    };

    let client = redis::Client::open(queue.redis_url.as_str())?;
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .with_context(|| format!("failed to connect to {}", queue.redis_url))?;

    eprintln!("Submitted job {} to queue {}", job.id, queue.queue_name);

    match submit_and_wait(&client, &mut conn, &queue.queue_name, &job, reply_timeout).await? {
        Some(reply) => {
            print_result(&reply.result)?;
            Ok(reply.result.exit_code)
        }
        None => bail!(
            "no worker replied to job {} within {}s",
            job.id,
            reply_timeout.as_secs()
        ),
    }
}

pub fn list_languages() -> Result<()> {
    let profiles = LanguageProfiles::builtin();
    let settings = SandboxSettings::from_env()?;
    let profiles = profiles.with_images(&settings.images);

    println!("{:<10} {:<22} {:<24} {:<16}", "LANGUAGE", "IMAGE", "BUILD", "RUN");
    println!("{}", "─".repeat(74));

    for profile in profiles.iter() {
        println!(
            "{:<10} {:<22} {:<24} {:<16}",
            profile.language,
            profile.image,
            profile.build_cmd.as_deref().unwrap_or("-"),
            profile.run_cmd
        );
    }

    println!("\nTotal: {} language(s)", profiles.iter().count());
    Ok(())
}
