//! Ralph mode: an autonomous loop that re-prompts one agent until a
//! completion signal appears in its output or the iteration cap is hit,
//! feeding the tail of each failed attempt into the next prompt.

use crate::agent::AgentManager;
use crate::constants::{DEFAULT_RALPH_ITERATIONS, RALPH_FAILURE_CONTEXT_CHARS};
use crate::executor::RunOptions;
use crate::Result;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RalphOptions {
    pub max_iterations: u32,
    /// Literal whose appearance in the output ends the loop.
    pub signal: String,
    pub run: RunOptions,
}

impl RalphOptions {
    pub fn new(signal: impl Into<String>) -> Self {
        Self {
            max_iterations: DEFAULT_RALPH_ITERATIONS,
            signal: signal.into(),
            run: RunOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RalphOutcome {
    pub completed: bool,
    pub iterations: u32,
}

/// Loop a single prompt on a single agent until the signal fires.
pub async fn run_ralph(
    agents: &AgentManager,
    name: &str,
    prompt: &str,
    opts: RalphOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<RalphOutcome> {
    let mut failure_context: Option<String> = None;

    for iteration in 1..=opts.max_iterations.max(1) {
        if *shutdown.borrow() {
            info!("[Ralph] Cancelled after {} iterations", iteration - 1);
            return Ok(RalphOutcome {
                completed: false,
                iterations: iteration - 1,
            });
        }

        let full_prompt = match &failure_context {
            Some(context) => format!(
                "{prompt}\n\nYour previous attempt did not emit the completion signal. \
                 Tail of its output:\n{context}\n\
                 Fix what is missing, then print exactly: {signal}",
                signal = opts.signal
            ),
            None => format!(
                "{prompt}\n\nWhen you are fully done, print exactly: {signal}",
                signal = opts.signal
            ),
        };

        info!(
            "[Ralph] Iteration {iteration}/{} on agent {name}",
            opts.max_iterations
        );
        let report = agents.run(name, &full_prompt, &opts.run).await?;

        if report.output.contains(&opts.signal) {
            info!("[Ralph] Completion signal observed on iteration {iteration}");
            return Ok(RalphOutcome {
                completed: true,
                iterations: iteration,
            });
        }

        warn!("[Ralph] No completion signal on iteration {iteration}");
        failure_context = Some(tail(&report.output, RALPH_FAILURE_CONTEXT_CHARS));
    }

    Ok(RalphOutcome {
        completed: false,
        iterations: opts.max_iterations.max(1),
    })
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
