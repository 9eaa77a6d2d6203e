//! Command handlers: thin shims between clap matches and the library.

use std::str::FromStr;

use anyhow::{bail, Context as _, Result};
use clap::ArgMatches;

use td::{
    db::{boards, issues, sessions, sync_rows, Store},
    project,
    session::SessionManager,
    sync::{
        engine::SyncEngine,
        snapshot::{self, BootstrapOutcome},
        transport::SyncTransport,
    },
    workflow,
};
use td_core::{
    Issue, IssueStatus, IssueType, Priority, Session, SyncSettings, TransitionAction,
};

/// Shared command context.
pub struct Context<'a> {
    /// Open store for this project.
    pub store: &'a Store,
    /// Session attributed to this invocation.
    pub session: &'a Session,
    /// Session manager over the same store.
    pub manager: &'a SessionManager,
}

/// Route a parsed subcommand to its handler.
pub async fn dispatch<T: SyncTransport>(
    ctx: &Context<'_>,
    engine: &mut SyncEngine<T>,
    settings: &SyncSettings,
    command: &str,
    sub: &ArgMatches,
) -> Result<()> {
    match command {
        "create" => create(ctx, sub).await,
        "list" => list(ctx, sub).await,
        "show" => show(ctx, sub).await,
        "start" => {
            transition(ctx, sub, TransitionAction::Start, sub.get_flag("force")).await
        }
        "unstart" => transition(ctx, sub, TransitionAction::Unstart, false).await,
        "close" => transition(ctx, sub, TransitionAction::Close, false).await,
        "review" => transition(ctx, sub, TransitionAction::Review, false).await,
        "approve" => transition(ctx, sub, TransitionAction::Approve, false).await,
        "reject" => transition(ctx, sub, TransitionAction::Reject, false).await,
        "block" => transition(ctx, sub, TransitionAction::Block, false).await,
        "unblock" => transition(ctx, sub, TransitionAction::Unblock, false).await,
        "reopen" => transition(ctx, sub, TransitionAction::Reopen, false).await,
        "delete" => delete(ctx, sub).await,
        "restore" => restore(ctx, sub).await,
        "dep" => dep(ctx, sub).await,
        "board" => board(ctx, sub).await,
        "session" => session_cmd(ctx, sub).await,
        "link" => link(engine, sub).await,
        "unlink" => unlink(engine).await,
        "sync" => sync(engine, settings, ctx, sub).await,
        other => bail!("unknown command '{other}'"),
    }
}

/// `td init`: create `.todos` and the database in the working directory.
pub async fn init() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let dir = project::init_project_dir(&cwd)?;
    let store = Store::create_or_open(&project::db_path(&dir)).await?;
    println!("initialized {} (device {})", dir.display(), store.device_id());
    Ok(())
}

async fn create(ctx: &Context<'_>, sub: &ArgMatches) -> Result<()> {
    let title: &String = sub.get_one("title").context("title required")?;
    let issue_type = match sub.get_one::<String>("type") {
        Some(raw) => IssueType::from_str(raw).map_err(|_| {
            anyhow::anyhow!("invalid type '{raw}' (bug, feature, task, epic, chore)")
        })?,
        None => IssueType::Task,
    };

    let mut issue = Issue::new(title, issue_type, &ctx.session.id, &ctx.session.branch)?;
    if let Some(raw) = sub.get_one::<String>("priority") {
        issue.priority =
            Priority::from_str(raw).map_err(|_| anyhow::anyhow!("invalid priority '{raw}'"))?;
    }
    if let Some(raw) = sub.get_one::<String>("points") {
        issue.set_points(raw.parse().context("points must be a number")?)?;
    }
    if let Some(parent) = sub.get_one::<String>("parent") {
        issue.parent_id = Some(parent.clone());
    }
    if let Some(desc) = sub.get_one::<String>("description") {
        issue.description = desc.clone();
    }
    issue.minor = sub.get_flag("minor");

    workflow::create_issue(ctx.store, &issue, ctx.session).await?;
    println!("{}  {}", issue.id, issue.title);
    Ok(())
}

async fn list(ctx: &Context<'_>, sub: &ArgMatches) -> Result<()> {
    let status = sub
        .get_one::<String>("status")
        .map(|raw| IssueStatus::from_str(raw))
        .transpose()
        .map_err(|_| anyhow::anyhow!("invalid status"))?;
    let mut conn = ctx.store.acquire().await?;
    for issue in issues::list(&mut conn, status).await? {
        println!(
            "{}  [{}] {}  {}",
            issue.id, issue.status, issue.priority, issue.title
        );
    }
    Ok(())
}

async fn show(ctx: &Context<'_>, sub: &ArgMatches) -> Result<()> {
    let id: &String = sub.get_one("id").context("id required")?;
    let mut conn = ctx.store.acquire().await?;
    let issue = issues::get(&mut conn, id)
        .await?
        .with_context(|| format!("no issue '{id}'"))?;
    println!("{}  {}", issue.id, issue.title);
    println!("  status: {}  type: {}  priority: {}", issue.status, issue.issue_type, issue.priority);
    if issue.points > 0 {
        println!("  points: {}", issue.points);
    }
    if let Some(parent) = &issue.parent_id {
        println!("  parent: {parent}");
    }
    if !issue.description.is_empty() {
        println!("  {}", issue.description);
    }
    println!("  created by {} on {}", issue.creator_session, issue.created_branch);
    Ok(())
}

async fn transition(
    ctx: &Context<'_>,
    sub: &ArgMatches,
    action: TransitionAction,
    force: bool,
) -> Result<()> {
    let id: &String = sub.get_one("id").context("id required")?;
    let issue = workflow::apply_transition(ctx.store, id, action, ctx.session, force).await?;
    println!("{}  {}", issue.id, issue.status);
    Ok(())
}

async fn delete(ctx: &Context<'_>, sub: &ArgMatches) -> Result<()> {
    let id: &String = sub.get_one("id").context("id required")?;
    workflow::delete_issue(ctx.store, id, ctx.session).await?;
    println!("{id} deleted");
    Ok(())
}

async fn restore(ctx: &Context<'_>, sub: &ArgMatches) -> Result<()> {
    let id: &String = sub.get_one("id").context("id required")?;
    workflow::restore_issue(ctx.store, id, ctx.session).await?;
    println!("{id} restored");
    Ok(())
}

async fn dep(ctx: &Context<'_>, sub: &ArgMatches) -> Result<()> {
    if let Some(("add", args)) = sub.subcommand() {
        let id: &String = args.get_one("id").context("id required")?;
        let on: &String = args.get_one("on").context("dependency required")?;
        workflow::add_dependency(ctx.store, id, on, ctx.session).await?;
        println!("{id} depends on {on}");
    }
    Ok(())
}

async fn board(ctx: &Context<'_>, sub: &ArgMatches) -> Result<()> {
    match sub.subcommand() {
        Some(("create", args)) => {
            let name: &String = args.get_one("name").context("name required")?;
            let board = boards::Board::new(name);
            let mut tx = ctx.store.begin().await?;
            boards::upsert_board(&mut tx, &board).await?;
            let data = serde_json::to_value(&board)?;
            td::db::actionlog::append(
                &mut tx,
                &ctx.session.id,
                td_core::ActionKind::BoardCreate,
                &td_core::EntityKind::Boards,
                &board.id,
                None,
                Some(&data),
                chrono::Utc::now(),
            )
            .await?;
            tx.commit().await.map_err(|e| td_core::Error::database(e.to_string()))?;
            println!("{}  {}", board.id, board.name);
        }
        Some(("list", _)) => {
            let mut conn = ctx.store.acquire().await?;
            for board in boards::list_boards(&mut conn).await? {
                println!("{}  {}", board.id, board.name);
            }
        }
        Some(("show", args)) => {
            let id: &String = args.get_one("board").context("board required")?;
            let mut conn = ctx.store.acquire().await?;
            for issue in boards::list_board_issues(&mut conn, id).await? {
                println!("{}  [{}] {}", issue.id, issue.status, issue.title);
            }
        }
        Some(("move", args)) => {
            let board_id: &String = args.get_one("board").context("board required")?;
            let issue_id: &String = args.get_one("id").context("id required")?;
            let slot: usize = args
                .get_one::<String>("slot")
                .context("slot required")?
                .parse()
                .context("slot must be a number")?;

            let mut tx = ctx.store.begin().await?;
            let outcome = boards::compute_insert(&mut tx, board_id, issue_id, slot).await?;
            // One journal entry per rewritten row, then the placed issue.
            for (moved_id, key) in &outcome.respaced {
                let data = serde_json::json!({
                    "board_id": board_id, "issue_id": moved_id, "position": key,
                });
                td::db::actionlog::append(
                    &mut tx,
                    &ctx.session.id,
                    td_core::ActionKind::BoardSetPosition,
                    &td_core::EntityKind::BoardIssuePositions,
                    moved_id,
                    None,
                    Some(&data),
                    chrono::Utc::now(),
                )
                .await?;
            }
            let data = serde_json::json!({
                "board_id": board_id, "issue_id": issue_id, "position": outcome.key,
            });
            td::db::actionlog::append(
                &mut tx,
                &ctx.session.id,
                td_core::ActionKind::BoardSetPosition,
                &td_core::EntityKind::BoardIssuePositions,
                issue_id,
                None,
                Some(&data),
                chrono::Utc::now(),
            )
            .await?;
            tx.commit().await.map_err(|e| td_core::Error::database(e.to_string()))?;

            if outcome.respaced.is_empty() {
                println!("{issue_id} placed");
            } else {
                println!("{issue_id} placed ({} rows respaced)", outcome.respaced.len());
            }
        }
        _ => {}
    }
    Ok(())
}

async fn session_cmd(ctx: &Context<'_>, sub: &ArgMatches) -> Result<()> {
    match sub.subcommand() {
        Some(("new", _)) => {
            let session = ctx.manager.rotate(&ctx.session.branch).await?;
            println!("{}  (rotated from {})", session.id, ctx.session.id);
        }
        Some(("list", _)) => {
            let mut conn = ctx.store.acquire().await?;
            for session in sessions::list(&mut conn).await? {
                let name = session.name.as_deref().unwrap_or("-");
                println!(
                    "{}  {}  {}  {}",
                    session.id, session.branch, session.agent_kind, name
                );
            }
        }
        _ => {
            let marker = if ctx.session.is_new { " (new)" } else { "" };
            println!(
                "{}  branch={}  agent={}{marker}",
                ctx.session.id, ctx.session.branch, ctx.session.agent_kind
            );
        }
    }
    Ok(())
}

async fn link<T: SyncTransport>(engine: &SyncEngine<T>, sub: &ArgMatches) -> Result<()> {
    let project: &String = sub.get_one("project").context("project id required")?;
    engine.link(project, sub.get_flag("confirm")).await?;
    println!("linked to {project}");
    Ok(())
}

async fn unlink<T: SyncTransport>(engine: &SyncEngine<T>) -> Result<()> {
    engine.unlink().await?;
    println!("unlinked");
    Ok(())
}

async fn sync<T: SyncTransport>(
    engine: &mut SyncEngine<T>,
    settings: &SyncSettings,
    ctx: &Context<'_>,
    sub: &ArgMatches,
) -> Result<()> {
    match sub.subcommand() {
        Some(("push", _)) => {
            let outcome = engine.push_once(&ctx.session.id).await?;
            println!("pushed {} entries in {} batches", outcome.pushed, outcome.batches);
        }
        Some(("pull", _)) => {
            if let BootstrapOutcome::Bootstrapped { snapshot_seq } =
                snapshot::run_bootstrap(engine, settings).await?
            {
                println!("bootstrapped from snapshot (seq {snapshot_seq})");
            }
            let outcome = engine.pull_once().await?;
            println!("applied {} events over {} pages", outcome.applied, outcome.pages);
            print_conflicts(&outcome.conflicts);
        }
        Some(("status", args)) => {
            let report = engine.sync_status().await?;
            println!("project: {}", report.state.project_id);
            println!(
                "pushed through action {}  pulled through seq {}",
                report.state.last_pushed_action_id, report.state.last_pulled_server_seq
            );
            println!("pending local entries: {}", report.pending);
            println!(
                "remote: {} events, latest seq {}",
                report.remote.event_count, report.remote.last_server_seq
            );
            if args.get_flag("verbose") {
                let mut conn = engine.store().acquire().await?;
                for line in sync_rows::list_history(&mut conn, 20).await? {
                    println!(
                        "  {} {} {} {} seq={}",
                        line.direction, line.action_type, line.entity_type, line.entity_id,
                        line.server_seq
                    );
                }
            }
        }
        _ => {
            // Bare `td sync`: bootstrap (first sync only, zero pending),
            // then push, then pull.
            if let BootstrapOutcome::Bootstrapped { snapshot_seq } =
                snapshot::run_bootstrap(engine, settings).await?
            {
                println!("bootstrapped from snapshot (seq {snapshot_seq})");
            }
            let pushed = engine.push_once(&ctx.session.id).await?;
            let pulled = engine.pull_once().await?;
            println!(
                "pushed {} entries, applied {} remote events",
                pushed.pushed, pulled.applied
            );
            print_conflicts(&pulled.conflicts);
        }
    }
    Ok(())
}

/// Bounded conflict summary: the first ten, then a count.
fn print_conflicts(conflicts: &[sync_rows::SyncConflict]) {
    if conflicts.is_empty() {
        return;
    }
    println!("warning: {} local edits were overwritten (kept in sync_conflicts):", conflicts.len());
    for conflict in conflicts.iter().take(10) {
        println!("  {} {} (seq {})", conflict.entity_type, conflict.entity_id, conflict.server_seq);
    }
    if conflicts.len() > 10 {
        println!("  ...and {} more", conflicts.len() - 10);
    }
}
