//! Ganglion Demo Binary
//!
//! Runs a directory and a handful of workers in one process over the loopback
//! network, performs `/demo/echo` and prints what came back.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use ganglion::agent::{pump, Agent};
use ganglion::clock::{Clock, SystemClock};
use ganglion::codec::Value;
use ganglion::config::{AgentConfig, ConfigLoader};
use ganglion::dispatch::{HandlerOutput, Scope};
use ganglion::logging::init_logging;
use ganglion::protocol::Requester;
use ganglion::resource::ResourcePath;
use ganglion::scheduler::{Outcome, Synapse};
use ganglion::transport::LoopbackNetwork;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::info;

const DIRECTORY: &str = "directory";
const CLIENT: &str = "client";

/// Ganglion demo - discover workers and fan an operation out to them
#[derive(Parser)]
#[command(name = "ganglion")]
#[command(about = "In-process demo of directory discovery and the streaming request protocol")]
struct Cli {
    /// Number of worker agents advertising /demo/echo
    #[arg(long, default_value_t = 3)]
    workers: usize,

    /// Fan-out scope: single, all or direct
    #[arg(long, default_value = "all")]
    scope: Scope,

    /// Text each worker echoes back
    #[arg(long, default_value = "hello")]
    message: String,

    /// Number of fragments each worker streams
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// Route authorization through the directory
    #[arg(long, default_value = "false")]
    authorize: bool,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut base = ConfigLoader::load_shared(cli.config.as_deref()).context("loading configuration")?;
    if let Some(level) = &cli.log_level {
        base.logging.level = level.clone();
    }
    init_logging(&base.logging, None)?;

    let result = run_demo(&cli, &base)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_demo(cli: &Cli, base: &AgentConfig) -> Result<serde_json::Value> {
    if cli.workers == 0 {
        bail!("at least one worker is required");
    }
    let clock: Rc<dyn Clock> = Rc::new(SystemClock);
    let network = LoopbackNetwork::new();
    let operation = ResourcePath::parse("/demo/echo")?;

    let agent_config = |address: String| {
        let mut config = base.clone();
        config.address = Some(address.into());
        config.directory = Some(DIRECTORY.into());
        if cli.authorize {
            config.authorizer = Some(DIRECTORY.into());
        }
        config
    };
    let spawn = |address: String| -> Result<Agent> {
        let (transport, inbox) = network.connect(address.as_str());
        Ok(Agent::new(
            &agent_config(address),
            Rc::new(transport),
            inbox,
            Rc::clone(&clock),
        )?)
    };

    let directory = spawn(DIRECTORY.to_string())?;
    directory.serve_directory(base.access.clone());
    let client = spawn(CLIENT.to_string())?;

    let mut workers = Vec::with_capacity(cli.workers);
    for index in 0..cli.workers {
        let worker = spawn(format!("worker-{}", index))?;
        let name = worker.address().to_string();
        let repeat = cli.repeat;
        worker.register_fn(operation.clone(), "echo", Vec::new(), move |job| {
            let text = job.get("message").and_then(Value::as_str).unwrap_or_default();
            for n in 0..repeat {
                job.result(format!("{} #{} from {}", text, n, name));
            }
            Ok(HandlerOutput::Empty)
        });
        workers.push(worker);
    }

    let mut agents: Vec<&Agent> = vec![&directory, &client];
    agents.extend(workers.iter());
    let deadline = Instant::now() + base.operation_timeout();

    let adverts = workers
        .iter()
        .map(|worker| worker.advertise_capabilities(base.advertise_ttl()))
        .collect::<Result<Vec<Requester>, _>>()?;
    drive(&agents, deadline, || adverts.iter().all(Requester::is_done))?;
    info!(workers = workers.len(), "Workers advertised");

    let mut args = BTreeMap::new();
    args.insert("message".to_string(), Value::from(cli.message.as_str()));
    let task = client.perform(operation, cli.scope, args)?;
    drive(&agents, deadline, || !task.is_pending())?;

    Ok(json!({
        "scope": cli.scope.as_str(),
        "workers": workers.len(),
        "results": outcome_json(&task)?,
    }))
}

/// Pump every agent until `done` holds, sleeping briefly when idle.
fn drive(agents: &[&Agent], deadline: Instant, done: impl Fn() -> bool) -> Result<()> {
    while !done() {
        if Instant::now() >= deadline {
            bail!("demo did not finish before the operation timeout");
        }
        if !pump(agents) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    Ok(())
}

fn outcome_json(task: &Synapse) -> Result<serde_json::Value> {
    match task.outcome() {
        Outcome::Succeeded(value) => Ok(plain_json(&value)),
        Outcome::Failed(err) => Err(anyhow!("operation failed: {}", err)),
        Outcome::Pending => Err(anyhow!("operation still pending")),
    }
}

fn plain_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::String(s) => json!(s),
        Value::Bytes(bytes) => json!(bytes),
        Value::DateTime(dt) => json!(dt.to_rfc3339()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(plain_json).collect()),
        Value::Struct(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), plain_json(v))).collect(),
        ),
        Value::Resource(path) => json!(path.to_string()),
        Value::Fault(fault) => json!({ "class": fault.class, "message": fault.message }),
    }
}
