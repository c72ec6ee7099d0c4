//! External-process generation backend
//!
//! Runs a generation CLI once per request, in the argument shape of
//! `mlx_lm.generate`:
//!
//! ```text
//! <program> --model <id> [--adapter-path <dir>] --max-tokens <n> --temp <t> --prompt <text>
//! ```

use anyhow::{Context, Result};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{SamplingParams, TextGenerator};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Generator that shells out to an external generation tool
pub struct SubprocessGenerator {
    program: String,
    model_id: String,
    adapter_path: Option<PathBuf>,
    /// The child is killed once it runs this long
    deadline: Duration,
    name: String,
}

impl SubprocessGenerator {
    pub fn new(
        program: impl Into<String>,
        model_id: impl Into<String>,
        adapter_path: Option<PathBuf>,
        deadline: Duration,
    ) -> Self {
        let program = program.into();
        let model_id = model_id.into();
        let name = match &adapter_path {
            Some(path) => format!("{}+{}", model_id, path.display()),
            None => model_id.clone(),
        };

        Self {
            program,
            model_id,
            adapter_path,
            deadline,
            name,
        }
    }

    fn build_command(&self, prompt: &str, params: &SamplingParams) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--model").arg(&self.model_id);
        if let Some(path) = &self.adapter_path {
            cmd.arg("--adapter-path").arg(path);
        }
        cmd.arg("--max-tokens")
            .arg(params.max_new_tokens.to_string())
            .arg("--temp")
            .arg(params.temperature.to_string())
            .arg("--prompt")
            .arg(prompt);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl TextGenerator for SubprocessGenerator {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String> {
        let mut child = self
            .build_command(prompt, params)
            .spawn()
            .with_context(|| format!("Failed to launch {}", self.program))?;

        // Drain both pipes while waiting so a chatty child never blocks on a full pipe
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let started = Instant::now();
        let kill_at = match params.deadline {
            Some(deadline) => deadline.min(started + self.deadline),
            None => started + self.deadline,
        };
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= kill_at {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!(
                    "{} ran for {:.2}s, past its deadline, and was killed",
                    self.program,
                    started.elapsed().as_secs_f64()
                );
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stdout = collect(stdout)?;
        let stderr = collect(stderr)?;

        if !status.success() {
            anyhow::bail!("{} exited with {}: {}", self.program, status, stderr.trim());
        }

        Ok(stdout.trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<std::io::Result<String>> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        pipe.read_to_string(&mut buf)?;
        Ok(buf)
    })
}

fn collect(reader: Option<JoinHandle<std::io::Result<String>>>) -> Result<String> {
    match reader {
        Some(handle) => handle
            .join()
            .map_err(|_| anyhow::anyhow!("Output reader thread panicked"))?
            .context("Failed to read child output"),
        None => Ok(String::new()),
    }
}
