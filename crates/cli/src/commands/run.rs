//! `superego run`: Submit input to a flow and stream the output.

use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use superego_config::AppConfig;
use superego_core::message::Role;
use superego_flow::{AuditLog, FlowEngine, FlowStreamEvent};

pub async fn run(
    config: AppConfig,
    flow_id: &str,
    input: Option<String>,
    instance: Option<String>,
    show_internal: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !config.has_api_key() {
        eprintln!("  ⚠️  No API key configured; set OPENROUTER_API_KEY or add one to");
        eprintln!("     {}", AppConfig::config_path().display());
    }

    let audit = Arc::new(AuditLog::new());
    let engine = super::build_engine(&config, audit.clone()).await?;

    if let Some(text) = input {
        let instance_id = submit(&engine, flow_id, &text, instance.as_deref()).await?;
        if show_internal {
            print_internal(&audit, &instance_id);
        }
        return Ok(());
    }

    println!("  Flow:      {flow_id}");
    println!("  Model:     {}", config.effective_model());
    println!("  Type your message and press Enter. 'exit' or Ctrl+D to quit.\n");

    let mut current = instance;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        match submit(&engine, flow_id, line, current.as_deref()).await {
            Ok(instance_id) => {
                if show_internal {
                    print_internal(&audit, &instance_id);
                    audit.clear();
                }
                current = Some(instance_id);
            }
            Err(e) => eprintln!("  Error: {e}"),
        }
        println!();
    }

    if let Some(id) = current {
        println!("  Instance: {id}");
    }
    Ok(())
}

/// Drive one submission to its end, printing events as they arrive.
async fn submit(
    engine: &FlowEngine,
    flow_id: &str,
    text: &str,
    instance_id: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let run = engine.submit(flow_id, text, instance_id).await?;
    let id = run.instance_id.clone();

    // Ctrl+C cancels the run; the instance keeps its record.
    let token = run.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let (mut events, handle) = run.into_parts();
    let mut printer = TerminalPrinter::new(std::io::stdout());
    while let Some(event) = events.recv().await {
        printer.event(&event)?;
    }
    interrupt.abort();
    handle.await?;

    Ok(id)
}

fn print_internal(audit: &AuditLog, instance_id: &str) {
    println!("\n  ── internal ──");
    for entry in audit.for_instance(instance_id) {
        let step = &entry.step;
        if step.role == Role::User {
            continue;
        }
        println!("  [{}]", step.agent_id);
        if let Some(thinking) = &step.thinking {
            println!("    thinking: {thinking}");
        }
        if let Some(guidance) = &step.agent_guidance {
            println!("    guidance: {guidance}");
        }
    }
}

/// Renders flow events as terminal text.
struct TerminalPrinter<W: Write> {
    out: W,
    /// Agent whose partial output is currently being printed
    streaming: Option<String>,
}

impl<W: Write> TerminalPrinter<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            streaming: None,
        }
    }

    fn event(&mut self, event: &FlowStreamEvent) -> std::io::Result<()> {
        match event {
            FlowStreamEvent::PartialOutput {
                agent_id, content, ..
            } => {
                if self.streaming.as_deref() != Some(agent_id.as_str()) {
                    write!(self.out, "\n[{agent_id}] ")?;
                    self.streaming = Some(agent_id.clone());
                }
                write!(self.out, "{content}")?;
            }
            FlowStreamEvent::CompleteStep { step, .. } => {
                if step.role == Role::User {
                    return Ok(());
                }
                // Nodes that answered without streaming get their response printed whole.
                if self.streaming.take().as_deref() != Some(step.agent_id.as_str()) {
                    write!(self.out, "\n[{}] {}", step.agent_id, step.response)?;
                }
                writeln!(self.out)?;
                for usage in &step.tool_usage {
                    writeln!(
                        self.out,
                        "    ⚙ {}({}) = {}",
                        usage.tool_name, usage.input, usage.output
                    )?;
                }
                let decision = step
                    .decision
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".into());
                let next = step.next_agent.as_deref().unwrap_or("end");
                writeln!(self.out, "    ↳ {decision} → {next}")?;
            }
            FlowStreamEvent::Error { message, status, .. } => {
                writeln!(self.out, "\n✗ Flow {status}: {message}")?;
            }
            FlowStreamEvent::Done { status, error, .. } => match error {
                Some(e) => writeln!(self.out, "\n✓ Flow {status}: {e}")?,
                None => writeln!(self.out, "\n✓ Flow {status}")?,
            },
        }
        self.out.flush()
    }
}
