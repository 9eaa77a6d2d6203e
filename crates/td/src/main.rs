//! td CLI - local-first issue tracking with journaled sync.

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command as ClapCommand};

mod commands;

use td::{
    db::Store,
    project,
    session::SessionManager,
    sync::{
        auto::AutoSync,
        engine::SyncEngine,
        transport::{HttpTransport, AUTO_SYNC_TIMEOUT, INTERACTIVE_TIMEOUT},
    },
};
use td_core::{FeatureGate, SyncSettings};

fn build_cli() -> ClapCommand {
    let id_arg = Arg::new("id").required(true).help("Issue id (td-xxxxxx)");
    ClapCommand::new("td")
        .version(env!("CARGO_PKG_VERSION"))
        .about("td - track issues and sessions from the terminal")
        .subcommand_required(true)
        .subcommand(ClapCommand::new("init").about("Initialize .todos in this directory"))
        .subcommand(
            ClapCommand::new("create")
                .about("Create an issue")
                .arg(Arg::new("title").required(true).help("Issue title"))
                .arg(
                    Arg::new("type")
                        .short('t')
                        .long("type")
                        .value_name("TYPE")
                        .help("bug, feature, task, epic, or chore"),
                )
                .arg(
                    Arg::new("priority")
                        .short('p')
                        .long("priority")
                        .value_name("PRIORITY")
                        .help("p0 through p4"),
                )
                .arg(
                    Arg::new("points")
                        .long("points")
                        .value_name("POINTS")
                        .help("Fibonacci story points"),
                )
                .arg(
                    Arg::new("parent")
                        .long("parent")
                        .value_name("ID")
                        .help("Parent issue id"),
                )
                .arg(
                    Arg::new("minor")
                        .long("minor")
                        .action(ArgAction::SetTrue)
                        .help("Exempt from the self-review rule"),
                )
                .arg(
                    Arg::new("description")
                        .short('d')
                        .long("description")
                        .value_name("TEXT")
                        .help("Longer description"),
                ),
        )
        .subcommand(
            ClapCommand::new("list").about("List issues").arg(
                Arg::new("status")
                    .long("status")
                    .value_name("STATUS")
                    .help("Filter by status"),
            ),
        )
        .subcommand(ClapCommand::new("show").about("Show one issue").arg(id_arg.clone()))
        .subcommand(
            ClapCommand::new("start")
                .about("Start work on an issue")
                .arg(id_arg.clone())
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Start even if blocked"),
                ),
        )
        .subcommand(ClapCommand::new("unstart").about("Put an issue back to open").arg(id_arg.clone()))
        .subcommand(ClapCommand::new("close").about("Close an issue").arg(id_arg.clone()))
        .subcommand(ClapCommand::new("review").about("Submit an issue for review").arg(id_arg.clone()))
        .subcommand(ClapCommand::new("approve").about("Approve a review").arg(id_arg.clone()))
        .subcommand(ClapCommand::new("reject").about("Send a review back").arg(id_arg.clone()))
        .subcommand(ClapCommand::new("block").about("Mark an issue blocked").arg(id_arg.clone()))
        .subcommand(ClapCommand::new("unblock").about("Unblock an issue").arg(id_arg.clone()))
        .subcommand(ClapCommand::new("reopen").about("Reopen an issue").arg(id_arg.clone()))
        .subcommand(ClapCommand::new("delete").about("Soft-delete an issue").arg(id_arg.clone()))
        .subcommand(ClapCommand::new("restore").about("Restore a deleted issue").arg(id_arg.clone()))
        .subcommand(
            ClapCommand::new("dep")
                .about("Manage dependencies")
                .subcommand_required(true)
                .subcommand(
                    ClapCommand::new("add")
                        .about("Record that one issue depends on another")
                        .arg(Arg::new("id").required(true).help("Dependent issue"))
                        .arg(Arg::new("on").required(true).help("Issue it depends on")),
                ),
        )
        .subcommand(
            ClapCommand::new("board")
                .about("Manage boards")
                .subcommand_required(true)
                .subcommand(
                    ClapCommand::new("create")
                        .about("Create a board")
                        .arg(Arg::new("name").required(true).help("Board name")),
                )
                .subcommand(ClapCommand::new("list").about("List boards"))
                .subcommand(
                    ClapCommand::new("show")
                        .about("List issues on a board")
                        .arg(Arg::new("board").required(true).help("Board id")),
                )
                .subcommand(
                    ClapCommand::new("move")
                        .about("Place an issue at a slot on a board")
                        .arg(Arg::new("board").required(true).help("Board id"))
                        .arg(Arg::new("id").required(true).help("Issue id"))
                        .arg(Arg::new("slot").required(true).help("Zero-based slot")),
                ),
        )
        .subcommand(
            ClapCommand::new("session")
                .about("Show or rotate the current session")
                .subcommand(ClapCommand::new("new").about("Force a new session"))
                .subcommand(ClapCommand::new("list").about("List known sessions")),
        )
        .subcommand(
            ClapCommand::new("link")
                .about("Link this project to a sync project")
                .arg(Arg::new("project").required(true).help("Remote project id"))
                .arg(
                    Arg::new("confirm")
                        .long("confirm")
                        .action(ArgAction::SetTrue)
                        .help("Confirm relinking and full replay"),
                ),
        )
        .subcommand(ClapCommand::new("unlink").about("Stop replicating this project"))
        .subcommand(
            ClapCommand::new("sync")
                .about("Sync explicitly")
                .subcommand(ClapCommand::new("push").about("Push pending entries"))
                .subcommand(ClapCommand::new("pull").about("Pull and apply remote events"))
                .subcommand(
                    ClapCommand::new("status").about("Show local and remote sync state").arg(
                        Arg::new("verbose")
                            .short('v')
                            .long("verbose")
                            .action(ArgAction::SetTrue)
                            .help("Include recent sync history"),
                    ),
                ),
        )
}

fn init_tracing() {
    // Logs go to stderr so they never mix with command output.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_tracing();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run()) {
        eprintln!("error: {e:#}");
        if let Some(core) = e.downcast_ref::<td_core::Error>() {
            if core.is_auth() {
                eprintln!("hint: re-login may be needed (or set TD_AUTH_KEY)");
            } else if core.is_transient() {
                eprintln!("hint: the sync server was unreachable; changes stay journaled locally");
            }
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let matches = build_cli().get_matches();
    let (command, sub) = matches
        .subcommand()
        .context("a subcommand is required")?;

    if command == "init" {
        return commands::init().await;
    }

    let project_dir = project::require_project_dir()?;
    let store = Store::open(&project::db_path(&project_dir)).await?;
    let branch = project::current_branch(&project_dir);
    let manager = SessionManager::new(store.clone());
    let session = manager.get_or_create(&branch).await?;

    let settings = SyncSettings::from_env();
    let gate = FeatureGate::load(&project_dir)?;
    let timeout = if command == "sync" {
        INTERACTIVE_TIMEOUT
    } else {
        AUTO_SYNC_TIMEOUT
    };
    let mut engine = SyncEngine::new(store.clone(), HttpTransport::new(timeout)?, gate);
    let auto = AutoSync::new(settings.clone());

    auto.on_startup(command, &engine, &session.id).await;
    if let Err(e) = manager.cleanup(&session.id).await {
        tracing::debug!(error = %e, "session cleanup failed");
    }

    let ctx = commands::Context {
        store: &store,
        session: &session,
        manager: &manager,
    };
    commands::dispatch(&ctx, &mut engine, &settings, command, sub).await?;

    if AutoSync::is_mutating_command(command) {
        auto.on_after_mutation(&engine, &session.id).await;
    }
    Ok(())
}
