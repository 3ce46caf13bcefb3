use anyhow::{anyhow, Context, Result};
use shipgraph::cli::commands::{
    CompileCommand, EngineArgs, HistoryCommand, NamesCommand, PublishCommand, SelfDeployCommand,
    StageCommand, StageKindCommand, TriggerCommand, ValidateCommand,
};
use shipgraph::cli::output::*;
use shipgraph::cli::{Cli, Command};
use shipgraph::compiler::compile_in;
use shipgraph::compiler::template::{render_in, webhook_secret_for};
use shipgraph::controller::{
    Controller, InMemoryEngine, KubectlEngine, PublishResult, SelfDeployOptions, SelfDeployStage,
    WorkflowEngine,
};
use shipgraph::core::config::{ConfigParser, PipelineConfig};
use shipgraph::core::identity::{teardown_plan, ResourceNameSet, SecretSource};
use shipgraph::core::trigger::{BranchFilter, TriggerEvent};
use shipgraph::persistence::{GraphHistory, InMemoryGraphHistory, LocalArtifactStore, PublishRecord};
use shipgraph::runtime::{BuildStage, EnvironmentDeployStage, ShellRunner, StageResult, TestStage};
use shipgraph::validation::{ValidationOptions, Validator};
use shipgraph::StageGraph;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Logs go to stderr; stdout carries documents and stage results
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("Failed to set logging subscriber: {}", e))?;

    let result = match &cli.command {
        Command::Validate(cmd) => validate(cmd).await,
        Command::Compile(cmd) => compile(cmd),
        Command::Publish(cmd) => publish(cmd).await,
        Command::SelfDeploy(cmd) => self_deploy(cmd).await,
        Command::Names(cmd) => names(cmd),
        Command::Trigger(cmd) => trigger(cmd),
        Command::Stage(cmd) => stage(cmd).await,
        Command::History(cmd) => history(cmd).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("{} {}", CROSS, style(format!("{:#}", e)).red());
        std::process::exit(1);
    }
    Ok(())
}

fn load_config(path: &Path, schema: Option<&Path>) -> Result<PipelineConfig> {
    let parser = match schema {
        Some(schema) => ConfigParser::from_schema_file(schema)?,
        None => ConfigParser::new(),
    };
    parser
        .parse_file(path)
        .context("Failed to load pipeline description")
}

async fn open_history(disabled: bool) -> Result<Arc<dyn GraphHistory>> {
    if disabled {
        return Ok(Arc::new(InMemoryGraphHistory::new()));
    }
    #[cfg(feature = "sqlite")]
    {
        Ok(Arc::new(
            shipgraph::persistence::SqliteGraphHistory::with_default_path().await?,
        ))
    }
    #[cfg(not(feature = "sqlite"))]
    {
        Ok(Arc::new(InMemoryGraphHistory::new()))
    }
}

async fn validate(cmd: &ValidateCommand) -> Result<()> {
    eprintln!("{} Validating {}...", INFO, style(cmd.config.display()).bold());

    let mut options = ValidationOptions::new(&cmd.config);
    options.schema_path = cmd.schema.clone();
    options.skip_credentials = cmd.skip_credentials;
    options.skip_context = cmd.skip_context;
    options.skip_tools = cmd.skip_tools;
    options.context_requirements = cmd.context_requirements.clone();
    options.cdk_json_path = cmd.cdk_json.clone();

    let report = Validator::new(ShellRunner::new(60), options).run().await;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for failure in &report.failures {
            println!("{}", failure);
        }
    }

    if !report.is_ok() {
        eprintln!(
            "{} {} check(s) failed",
            CROSS,
            style(report.failures.len()).red()
        );
        std::process::exit(1);
    }
    eprintln!("{} All checks passed", CHECK);
    Ok(())
}

fn compile(cmd: &CompileCommand) -> Result<()> {
    let config = load_config(&cmd.config, cmd.schema.as_deref())?;
    let names = cmd.identity.resource_names()?;
    let graph = compile_in(&config, &names, &cmd.images.image_set(), &cmd.namespace)?;

    eprintln!("{}", format_graph(&graph));

    let document = if cmd.json {
        serde_json::to_string_pretty(&graph)?
    } else {
        render_in(&graph, &cmd.namespace).to_yaml()?
    };

    match &cmd.output {
        Some(path) => {
            std::fs::write(path, document)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("{} Wrote {}", CHECK, style(path.display()).bold());
        }
        None => println!("{}", document),
    }
    Ok(())
}

async fn publish_graph<E: WorkflowEngine>(
    engine: E,
    graph: &StageGraph,
    args: &EngineArgs,
    commit: Option<&str>,
) -> Result<PublishResult> {
    let mut controller = Controller::new(engine)
        .with_namespace(&args.namespace)
        .with_history(open_history(args.no_history || args.dry_run).await?);
    if let Some(commit) = commit {
        controller = controller.with_commit(commit);
    }

    let spinner = create_spinner(format!("Publishing {}", graph.name));
    let result = controller.publish(graph).await;
    spinner.finish_and_clear();
    Ok(result?)
}

async fn publish(cmd: &PublishCommand) -> Result<()> {
    let config = load_config(&cmd.config, cmd.schema.as_deref())?;
    let names = cmd.identity.resource_names()?;
    let graph = compile_in(
        &config,
        &names,
        &cmd.images.image_set(),
        &cmd.engine.namespace,
    )?;
    eprintln!("{}", format_graph(&graph));

    let commit = cmd.commit.as_deref();
    let result = if cmd.engine.dry_run {
        publish_graph(InMemoryEngine::new(), &graph, &cmd.engine, commit).await?
    } else {
        let engine = KubectlEngine::new(
            &cmd.engine.kubectl,
            &cmd.engine.namespace,
            cmd.engine.kubectl_timeout,
        );
        publish_graph(engine, &graph, &cmd.engine, commit).await?
    };

    println!("{}", format_publish_result(&graph.name, &result));
    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_self_deploy<E: WorkflowEngine>(
    engine: E,
    cmd: &SelfDeployCommand,
    options: SelfDeployOptions,
) -> Result<()> {
    let names = cmd.identity.resource_names()?;
    let graph_name = names.graph().to_string();
    let runner = ShellRunner::default();
    let mut stage = SelfDeployStage::new(runner, engine, names, options)
        .with_namespace(&cmd.engine.namespace)
        .with_history(open_history(cmd.engine.no_history || cmd.engine.dry_run).await?);

    let report = stage.run().await?;

    println!("{}", format_sub_step("pipeline infrastructure", &report.infrastructure));
    println!("{}", format_sub_step("stage graph", &report.graph));
    if let Some(result) = &report.publish {
        println!("{}", format_publish_result(&graph_name, result));
    }

    // A failed publish leaves the previous graph live; only a halted run is fatal
    if report.infrastructure.is_failure() && !cmd.continue_on_error {
        std::process::exit(1);
    }
    Ok(())
}

async fn self_deploy(cmd: &SelfDeployCommand) -> Result<()> {
    eprintln!(
        "{} Self-deploy of {} at {}",
        ROCKET,
        style(&cmd.identity.instance).bold(),
        style(&cmd.commit).dim()
    );

    let mut options = SelfDeployOptions::new(&cmd.repo_url, &cmd.commit, &cmd.workspace);
    options.config_file = cmd.config_file.clone();
    options.schema_file = cmd.schema_file.clone();
    options.infra_dir = cmd.infra_dir.clone();
    options.infra_stack = cmd.infra_stack.clone();
    options.images = cmd.images.image_set();
    options.continue_on_error = cmd.continue_on_error;

    if cmd.engine.dry_run {
        run_self_deploy(InMemoryEngine::new(), cmd, options).await
    } else {
        let engine = KubectlEngine::new(
            &cmd.engine.kubectl,
            &cmd.engine.namespace,
            cmd.engine.kubectl_timeout,
        );
        run_self_deploy(engine, cmd, options).await
    }
}

fn webhook_secret(cmd: &NamesCommand, names: &ResourceNameSet) -> Result<()> {
    let source = SecretSource::for_instance(cmd.webhook_secret_ref.clone());
    match webhook_secret_for(names, &source, &cmd.events_namespace) {
        Some(manifest) => {
            eprintln!(
                "{} Generated webhook secret {} for {}",
                CHECK,
                style(names.webhook_secret()).cyan(),
                style(names.instance()).bold()
            );
            if cmd.json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                println!("{}", manifest.to_yaml()?);
            }
        }
        None => {
            if let SecretSource::External { secret_ref } = &source {
                println!(
                    "{} {} validates webhooks with external secret {}; nothing generated",
                    INFO,
                    style(names.instance()).bold(),
                    style(secret_ref).cyan()
                );
            }
        }
    }
    Ok(())
}

fn names(cmd: &NamesCommand) -> Result<()> {
    let names = cmd.identity.resource_names()?;

    if cmd.webhook_secret || cmd.webhook_secret_ref.is_some() {
        return webhook_secret(cmd, &names);
    }

    if cmd.teardown {
        let plan = teardown_plan(&names);
        plan.verify(&names)?;
        if cmd.json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        } else {
            println!("{}", format_teardown(&plan));
        }
        return Ok(());
    }

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&names)?);
    } else {
        println!("{}", format_names(&names));
    }
    Ok(())
}

fn trigger(cmd: &TriggerCommand) -> Result<()> {
    let raw = if cmd.payload == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Failed to read payload from stdin")?;
        raw
    } else {
        std::fs::read_to_string(&cmd.payload)
            .with_context(|| format!("Payload file not found: {}", cmd.payload))?
    };
    let payload: serde_json::Value =
        serde_json::from_str(&raw).context("Payload is not valid JSON")?;
    let event = TriggerEvent::from_webhook_payload(&payload)?;
    let filter = BranchFilter::new(&cmd.branch);
    let matched = filter.matches(&event);

    if cmd.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "event": event,
                "branch": event.branch(),
                "target": filter.target(),
                "matches": matched,
            }))?
        );
    } else if matched {
        println!(
            "{} {} on {} starts an execution",
            CHECK,
            style(&event.commit_id).bold(),
            style(filter.target()).cyan()
        );
    } else {
        println!(
            "{} {} ignored (not {})",
            INFO,
            style(&event.branch_ref).dim(),
            style(filter.target()).cyan()
        );
    }

    if !matched {
        std::process::exit(1);
    }
    Ok(())
}

async fn stage(cmd: &StageCommand) -> Result<()> {
    let result = match &cmd.stage {
        StageKindCommand::Build(args) => {
            let config = load_config(&args.common.config, None)?;
            let store = match &args.store {
                Some(root) => LocalArtifactStore::new(root),
                None => LocalArtifactStore::with_default_path(&args.bucket)?,
            };
            let mut build = BuildStage::new(
                ShellRunner::new(args.common.timeout),
                Arc::new(store),
                &args.common.workspace,
                config.build.commands.clone(),
            );
            if args.upload {
                build = build.with_upload(&args.bucket);
            }
            build.run(&args.commit).await
        }
        StageKindCommand::Deploy(args) => {
            let config = load_config(&args.common.config, None)?;
            let environment = config
                .environment(&args.environment)
                .with_context(|| format!("Unknown environment: {}", args.environment))?
                .clone();
            let mut deploy = EnvironmentDeployStage::new(
                ShellRunner::new(args.common.timeout),
                environment,
                &args.common.workspace,
            )
            .with_outputs_file(&args.outputs_file);
            if let Some(path) = &args.artifact_path {
                deploy = deploy.with_artifact_path(path);
            }
            deploy.run().await
        }
        StageKindCommand::Test(args) => {
            let config = load_config(&args.common.config, None)?;
            let environment = config
                .environment(&args.environment)
                .with_context(|| format!("Unknown environment: {}", args.environment))?;
            let commands = environment
                .tests
                .as_ref()
                .map(|t| t.commands.clone())
                .unwrap_or_default();
            let mut tests = TestStage::new(
                ShellRunner::new(args.common.timeout),
                &environment.name,
                commands,
                &args.common.workspace,
            );
            if let Some(outputs) = &args.stack_outputs {
                tests = tests.with_stack_outputs(outputs);
            }
            tests.run().await
        }
    };

    match result {
        Ok(result) => {
            println!("{}", result.to_json()?);
            Ok(())
        }
        Err(e) => {
            let failure = StageResult::failure(shipgraph::core::secrets::redact(&format!("{:#}", e)));
            println!("{}", failure.to_json()?);
            std::process::exit(1);
        }
    }
}

async fn history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_history(false).await?;

    let mut records: Vec<PublishRecord> = match &cmd.graph {
        Some(graph) => store.list(graph).await?,
        None => {
            let mut all = Vec::new();
            for graph in store.list_graphs().await? {
                all.extend(store.list(&graph).await?);
            }
            all.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
            all
        }
    };
    records.truncate(cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "records": records });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("{} No publish history found", INFO);
        return Ok(());
    }

    println!("{} Publish history (showing latest {}):", INFO, cmd.limit);
    for record in &records {
        println!("  {}", format_record(record));
    }
    Ok(())
}
