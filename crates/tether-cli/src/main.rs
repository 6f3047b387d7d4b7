use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether_core::app::{App, AppBuilder};
use tether_core::config::MirrorConfig;
use tether_core::domain::{
    Reference, StatusSegment, StepError, StepInfo, TopicFilter, WorkflowId, WorkflowStatus,
};
use tether_core::impls::{InMemoryEngine, RumqttTransport};
use tether_core::ports::WorkflowEngine;
use tether_core::typed::{WorkflowData, WorkflowPayload};

/// tether - mirror workflow state to an MQTT v5 broker
#[derive(Parser)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration (defaults apply when omitted)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Broker host, overrides mqtt.host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Broker port, overrides mqtt.port
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mirror against the configured broker until Ctrl-C
    Serve,

    /// Drive one demo workflow on the in-process engine
    Simulate {
        #[arg(long, default_value = "DemoOrder")]
        definition: String,

        #[arg(long, default_value_t = 1)]
        version: u32,

        /// Steps to run after Init
        #[arg(long, default_value_t = 3)]
        steps: u32,

        #[arg(long, default_value_t = 500)]
        step_delay_ms: u64,

        /// Abort the last step instead of completing the workflow
        #[arg(long)]
        abort: bool,
    },

    /// Print the topic an instance is replicated to
    Topic {
        definition: String,
        version: u32,
        reference: String,

        /// Print the final topic instead of the active one
        #[arg(long = "final")]
        finished: bool,
    },

    /// Check a topic against a filter (exit status 0 on match, 1 otherwise)
    Match { filter: String, topic: String },
}

/// Data carried by the demo workflow.
#[derive(Debug, Serialize, Deserialize)]
struct DemoOrder {
    order_id: String,
    items: u32,
}

impl WorkflowPayload for DemoOrder {
    const TYPE: &'static str = "tether.demo_order.v1";
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Simulate {
            definition,
            version,
            steps,
            step_delay_ms,
            abort,
        } => simulate(config, &definition, version, steps, Duration::from_millis(step_delay_ms), abort).await?,
        Commands::Topic {
            definition,
            version,
            reference,
            finished,
        } => {
            let segment = if finished {
                StatusSegment::Final
            } else {
                StatusSegment::Active
            };
            let scheme = config.replication.scheme();
            let topic = scheme
                .topic_for(&definition, version, &Reference::new(reference), segment)
                .context("cannot build a topic from these parts")?;
            println!("{topic}");
        }
        Commands::Match { filter, topic } => {
            let filter = TopicFilter::new(filter.as_str()).context("invalid topic filter")?;
            let matched = filter.matches(&topic);
            println!("{}", if matched { "match" } else { "no match" });
            if !matched {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_config(cli: &Cli) -> Result<MirrorConfig> {
    let mut config = match &cli.config {
        Some(path) => MirrorConfig::load(path)
            .with_context(|| format!("failed to load config: {}", path.display()))?,
        None => MirrorConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.mqtt.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.mqtt.port = port;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// 本番構成: rumqttc の Transport とプロセス内エンジン
fn build(config: MirrorConfig) -> Result<(Arc<App>, Arc<InMemoryEngine>)> {
    let (transport, events) = RumqttTransport::new(&config.mqtt);
    let engine = Arc::new(InMemoryEngine::new());
    let app = AppBuilder::new(config)
        .transport(Arc::new(transport), events)
        .engine(engine.clone())
        .build()
        .context("failed to build the mirror")?;
    engine.set_hooks(app.hooks());
    Ok((Arc::new(app), engine))
}

async fn serve(config: MirrorConfig) -> Result<()> {
    info!(host = %config.mqtt.host, port = config.mqtt.port, "starting mirror");
    let (app, _engine) = build(config)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl-C");
                return;
            }
            info!("Ctrl-C received, shutting down");
            cancel.cancel();
        });
    }

    app.run(cancel).await.context("mirror stopped with an error")?;
    println!("{}", serde_json::to_string_pretty(&app.status().await)?);
    Ok(())
}

async fn simulate(
    config: MirrorConfig,
    definition: &str,
    version: u32,
    steps: u32,
    step_delay: Duration,
    abort: bool,
) -> Result<()> {
    let connect_timeout = config.mqtt.connect_timeout();
    let scheme = config.replication.scheme();
    let (app, engine) = build(config)?;

    let cancel = CancellationToken::new();
    let running = {
        let app = Arc::clone(&app);
        let cancel = cancel.clone();
        tokio::spawn(async move { app.run(cancel).await })
    };

    tokio::time::timeout(connect_timeout, app.connection().wait_ready())
        .await
        .context("broker did not become ready")??;

    // 1) 開始: Init ステップで reference が決まり active トピックに載る
    let data = WorkflowData::from_payload(&DemoOrder {
        order_id: "order-1001".to_string(),
        items: 3,
    })?;
    let id = engine.start_workflow(definition, version, data).await?;
    let instance = current(&engine, &id).await?;
    println!("started: id={id} reference={}", instance.reference);
    println!("  active: {}", scheme.instance_topic(&instance, StatusSegment::Active)?);

    // 2) ステップを順に実行（各ステップの前後で複製される）
    for n in 1..=steps {
        sleep(step_delay).await;
        let name = format!("Step{n}");
        if abort && n == steps {
            println!("aborting at {name}");
            engine.raise_step_error(
                &id,
                StepInfo {
                    id: n as i32,
                    name: Some(name),
                },
                StepError::abort("simulated abort"),
            );
            break;
        }
        engine.run_step(&id, &name).await?;
        println!("ran {name}");
    }

    // 3) 完了、または reconciler による終了を待つ
    if abort {
        wait_for_terminal(&engine, &id, connect_timeout).await?;
    } else {
        engine.finish(&id, WorkflowStatus::Complete).await?;
    }
    let finished = current(&engine, &id).await?;
    println!("finished: status={}", finished.status);
    println!("  final: {}", scheme.instance_topic(&finished, StatusSegment::Final)?);

    cancel.cancel();
    running.await?.context("mirror stopped with an error")?;
    Ok(())
}

async fn current(engine: &InMemoryEngine, id: &WorkflowId) -> Result<tether_core::domain::WorkflowInstance> {
    match engine.get_workflow_instance(id).await? {
        Some(instance) => Ok(instance),
        None => bail!("workflow {id} disappeared"),
    }
}

async fn wait_for_terminal(engine: &InMemoryEngine, id: &WorkflowId, limit: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if current(engine, id).await?.status.is_terminal() {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }
    bail!("workflow {id} was not terminated within {limit:?}")
}
