use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use wdsync_core::WikidotError;
use wdsync_core::accounts::WikidotAccounts;
use wdsync_core::config::{WdsyncConfig, load_config};
use wdsync_core::frontmatter::parse;
use wdsync_core::host::{InputRequest, Prompter, Renderer, TextBuffer};
use wdsync_core::merge::{MergeSelection, unified_diff};
use wdsync_core::page::{PageRef, PageResolver};
use wdsync_core::preview::WikidotRenderer;
use wdsync_core::revuri::RevUri;
use wdsync_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use wdsync_core::session::{Session, SessionManager};
use wdsync_core::state::StateStore;
use wdsync_core::sync::{
    FetchOutcome, PushOutcome, SyncSettings, Synchronizer, logout, select_session, switch_account,
};
use wdsync_core::transport::Transport;

#[derive(Debug, Parser)]
#[command(
    name = "wdsync",
    version,
    about = "Fetch, edit and push wikidot pages from local files"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log requests and workflow steps")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Status,
    Login(LoginArgs),
    Logout(LogoutArgs),
    #[command(about = "List stored accounts and check that they are still valid")]
    Accounts,
    #[command(about = "Choose the account used by default")]
    Switch,
    Fetch(FileArgs),
    Push(FileArgs),
    Merge(MergeArgs),
    #[command(about = "Print a page revision document (wikidot-rev:// URI)")]
    Show(ShowArgs),
    Source(PageArgs),
    History(HistoryArgs),
    Preview(PreviewArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Default site for files without `site:`")]
    site: Option<String>,
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
}

#[derive(Debug, Args)]
struct LoginArgs {
    #[arg(long, value_name = "NAME", help = "Prefill the username prompt")]
    label: Option<String>,
}

#[derive(Debug, Args)]
struct LogoutArgs {
    #[arg(value_name = "ACCOUNT", help = "Account id or name; prompts when omitted")]
    account: Option<String>,
}

#[derive(Debug, Args)]
struct FileArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct MergeArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,
    #[arg(long, value_name = "FILE|URI", help = "Remote text: a file or a wikidot-rev:// URI")]
    remote: String,
    #[arg(long = "lines", value_name = "A-B", help = "One-based line range of the remote text")]
    lines: Vec<MergeSelection>,
    #[arg(long, conflicts_with = "lines", help = "Take every remote change")]
    all: bool,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(value_name = "URI")]
    uri: String,
}

#[derive(Debug, Args)]
struct PageArgs {
    site: String,
    page: String,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    site: String,
    page: String,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
struct PreviewArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,
    #[arg(long, value_name = "PATH", help = "Write HTML here instead of stdout")]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    let result = match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Login(args)) => run_login(&runtime, args),
        Some(Commands::Logout(args)) => run_logout(&runtime, args),
        Some(Commands::Accounts) => run_accounts(&runtime),
        Some(Commands::Switch) => run_switch(&runtime),
        Some(Commands::Fetch(args)) => run_fetch(&runtime, args),
        Some(Commands::Push(args)) => run_push(&runtime, args),
        Some(Commands::Merge(args)) => run_merge(&runtime, args),
        Some(Commands::Show(args)) => run_show(&runtime, args),
        Some(Commands::Source(args)) => run_source(&runtime, args),
        Some(Commands::History(args)) => run_history(&runtime, args),
        Some(Commands::Preview(args)) => run_preview(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    };

    match result {
        Err(error)
            if error
                .downcast_ref::<WikidotError>()
                .is_some_and(WikidotError::is_cancellation) =>
        {
            eprintln!("{error}");
            Ok(())
        }
        other => other,
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();
}

/// Everything a remote command needs, opened once per invocation.
struct Workspace {
    paths: ResolvedPaths,
    config: WdsyncConfig,
    state: StateStore,
    transport: Transport,
    prompter: StdioPrompter,
}

impl Workspace {
    fn open(runtime: &RuntimeOptions) -> Result<Self> {
        let paths = resolve_runtime_paths(runtime)?;
        let status = inspect_runtime(&paths)?;
        ensure_runtime_ready(&paths, &status)?;
        let config = load_config(&paths.config_path)?;
        let state = StateStore::open(&paths.db_path)?;
        let transport = Transport::from_config(&config)?;
        debug!(
            project_root = %normalize_for_display(&paths.project_root),
            site = ?config.site(),
            "workspace opened"
        );
        if runtime.diagnostics {
            println!("[diagnostics]\n{}\n", paths.diagnostics());
        }
        Ok(Self {
            paths,
            config,
            state,
            transport,
            prompter: StdioPrompter::default(),
        })
    }

    fn synchronizer(&self) -> Synchronizer<'_, wdsync_core::transport::HttpConnector> {
        Synchronizer::new(
            &self.transport,
            &self.prompter,
            &self.state,
            SyncSettings::from_config(&self.config),
        )
    }

    fn session(&self, required: bool) -> Result<Option<Session>> {
        let accounts = WikidotAccounts::new(&self.transport, self.config.auth_settings());
        let mut manager = SessionManager::new(&accounts, &self.prompter, &self.state);
        manager.load()?;
        Ok(select_session(
            &mut manager,
            &self.state,
            &self.prompter,
            required,
            self.config.account_select(),
        )?)
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            site: args.site,
            force: args.force,
        },
    )?;
    StateStore::open(&paths.db_path)?;

    println!("Initialized wdsync runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    println!("runtime status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!(
        "db_exists: {} ({})",
        format_flag(status.db_exists),
        status
            .db_size_bytes
            .map(|bytes| format!("{bytes} bytes"))
            .unwrap_or_else(|| "n/a".to_string())
    );
    if status.db_exists {
        let state = StateStore::open(&paths.db_path)?;
        let entries = state.ledger_entries()?;
        println!("synced_pages: {}", entries.len());
        for entry in entries {
            println!(
                "  {}/{} revision={} hash={}",
                entry.site,
                entry.page,
                entry
                    .revision
                    .map(|revision| revision.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                entry.content_hash
            );
        }
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_login(runtime: &RuntimeOptions, args: LoginArgs) -> Result<()> {
    let workspace = Workspace::open(runtime)?;
    let accounts = WikidotAccounts::new(&workspace.transport, workspace.config.auth_settings());
    let mut manager = SessionManager::new(&accounts, &workspace.prompter, &workspace.state);
    manager.load()?;
    let session = manager.create_session(args.label.as_deref())?;
    println!("Logged in as {} (id {})", session.label, session.id);
    Ok(())
}

fn run_logout(runtime: &RuntimeOptions, args: LogoutArgs) -> Result<()> {
    let workspace = Workspace::open(runtime)?;
    let accounts = WikidotAccounts::new(&workspace.transport, workspace.config.auth_settings());
    let mut manager = SessionManager::new(&accounts, &workspace.prompter, &workspace.state);
    manager.load()?;
    if let Some(session) = logout(
        &mut manager,
        &workspace.state,
        &workspace.prompter,
        args.account.as_deref(),
    )? {
        println!("Logged out {}", session.label);
    }
    Ok(())
}

fn run_accounts(runtime: &RuntimeOptions) -> Result<()> {
    let workspace = Workspace::open(runtime)?;
    let accounts = WikidotAccounts::new(&workspace.transport, workspace.config.auth_settings());
    let mut manager = SessionManager::new(&accounts, &workspace.prompter, &workspace.state);
    let sessions = manager.restore()?;
    if sessions.is_empty() {
        println!("accounts: <none> (run `wdsync login`)");
        return Ok(());
    }
    println!("accounts.count: {}", sessions.len());
    for session in sessions {
        println!(
            "  {} id={} expires={}",
            session.label,
            session.id,
            session
                .expires_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string())
        );
    }
    Ok(())
}

fn run_switch(runtime: &RuntimeOptions) -> Result<()> {
    let workspace = Workspace::open(runtime)?;
    let accounts = WikidotAccounts::new(&workspace.transport, workspace.config.auth_settings());
    let mut manager = SessionManager::new(&accounts, &workspace.prompter, &workspace.state);
    manager.load()?;
    let session = switch_account(&mut manager, &workspace.state, &workspace.prompter)?;
    println!("Using {} (id {})", session.label, session.id);
    Ok(())
}

fn run_fetch(runtime: &RuntimeOptions, args: FileArgs) -> Result<()> {
    let workspace = Workspace::open(runtime)?;
    let session = workspace.session(false)?;
    let mut buffer = FileBuffer::open(&args.file)?;
    let outcome = workspace
        .synchronizer()
        .fetch(&mut buffer, session.as_ref())?;
    report_fetch(&args.file, &buffer, outcome)
}

fn report_fetch(file: &Path, buffer: &FileBuffer, outcome: FetchOutcome) -> Result<()> {
    match outcome {
        FetchOutcome::Missing | FetchOutcome::UpToDate { .. } => {}
        FetchOutcome::Overwritten { revision } => {
            println!(
                "Fetched {} at revision {}",
                buffer.name(),
                format_revision(revision)
            );
        }
        FetchOutcome::Diff { uri, remote_text } => {
            let local = buffer.text()?;
            print!(
                "{}",
                unified_diff(&local, &remote_text, &buffer.name(), &uri.to_string())
            );
            println!(
                "\nMerge with: wdsync merge {} --remote {uri} --lines A-B (or --all)",
                normalize_for_display(file)
            );
        }
    }
    Ok(())
}

fn run_push(runtime: &RuntimeOptions, args: FileArgs) -> Result<()> {
    let workspace = Workspace::open(runtime)?;
    let Some(session) = workspace.session(true)? else {
        bail!("pushing requires a logged-in account (run `wdsync login`)");
    };
    let mut buffer = FileBuffer::open(&args.file)?;
    match workspace.synchronizer().push(&mut buffer, &session)? {
        PushOutcome::Pushed {
            revision,
            compensated,
        } => {
            println!(
                "Pushed {} as {} (revision {})",
                buffer.name(),
                session.label,
                format_revision(revision)
            );
            if compensated {
                println!("Tags were saved in a separate edit.");
            }
            Ok(())
        }
        PushOutcome::Fetched(outcome) => report_fetch(&args.file, &buffer, outcome),
    }
}

fn run_merge(runtime: &RuntimeOptions, args: MergeArgs) -> Result<()> {
    if args.lines.is_empty() && !args.all {
        bail!("choose remote lines with --lines A-B or take every change with --all");
    }
    let workspace = Workspace::open(runtime)?;
    let remote_text = match args.remote.parse::<RevUri>() {
        Ok(uri) => {
            let session = workspace.session(false)?;
            workspace
                .synchronizer()
                .provide_document(&uri, session.as_ref())?
        }
        Err(_) => fs::read_to_string(&args.remote)
            .with_context(|| format!("failed to read {}", args.remote))?,
    };

    let mut buffer = FileBuffer::open(&args.file)?;
    buffer.selections = args.lines;
    let synchronizer = workspace.synchronizer();
    let applied = if args.all {
        synchronizer.merge_all(&mut buffer, &remote_text)?
    } else {
        let selections = buffer.selections();
        synchronizer.merge_selected(&mut buffer, &remote_text, &selections)?
    };
    println!("Applied {applied} change(s) to {}", buffer.name());
    Ok(())
}

fn run_show(runtime: &RuntimeOptions, args: ShowArgs) -> Result<()> {
    let uri: RevUri = args.uri.parse()?;
    let workspace = Workspace::open(runtime)?;
    let session = workspace.session(false)?;
    print!(
        "{}",
        workspace
            .synchronizer()
            .provide_document(&uri, session.as_ref())?
    );
    Ok(())
}

fn run_source(runtime: &RuntimeOptions, args: PageArgs) -> Result<()> {
    let workspace = Workspace::open(runtime)?;
    let session = workspace.session(false)?;
    let resolver = PageResolver::new(&workspace.transport);
    let source = resolver.get_source(
        &args.site,
        &PageRef::from(args.page.as_str()),
        session.as_ref().map(|session| session.token.as_str()),
    )?;
    print!("{source}");
    Ok(())
}

fn run_history(runtime: &RuntimeOptions, args: HistoryArgs) -> Result<()> {
    let workspace = Workspace::open(runtime)?;
    let session = workspace.session(false)?;
    let resolver = PageResolver::new(&workspace.transport);
    let rows = resolver.get_history(
        &args.site,
        &PageRef::from(args.page.as_str()),
        session.as_ref().map(|session| session.token.as_str()),
        args.limit,
    )?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn run_preview(runtime: &RuntimeOptions, args: PreviewArgs) -> Result<()> {
    let workspace = Workspace::open(runtime)?;
    let buffer = FileBuffer::open(&args.file)?;
    let data = parse(&buffer.text()?)?;
    let site = if data.meta.site.is_empty() {
        workspace
            .config
            .site()
            .context("file has no `site:` and no default site is configured")?
    } else {
        data.meta.site.clone()
    };
    let session = workspace.session(false)?;
    let renderer = WikidotRenderer::new(
        &workspace.transport,
        &site,
        &data.meta.page,
        session.map(|session| session.token),
    );
    let output = renderer.render(&data.source)?;
    match args.output {
        Some(path) => {
            fs::write(&path, &output.html)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote preview to {}", normalize_for_display(&path));
        }
        None => println!("{}", output.html),
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", workspace.paths.diagnostics());
    }
    Ok(())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

/// A local file standing in for an editor buffer.
struct FileBuffer {
    path: PathBuf,
    selections: Vec<MergeSelection>,
}

impl FileBuffer {
    fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("no such file: {}", normalize_for_display(path));
        }
        Ok(Self {
            path: path.to_path_buf(),
            selections: Vec::new(),
        })
    }
}

impl TextBuffer for FileBuffer {
    fn name(&self) -> String {
        normalize_for_display(&self.path)
    }

    fn text(&self) -> wdsync_core::Result<String> {
        fs::read_to_string(&self.path).map_err(|error| {
            WikidotError::Storage(format!("failed to read {}: {error}", self.name()))
        })
    }

    fn replace_all(&mut self, text: &str) -> wdsync_core::Result<()> {
        fs::write(&self.path, text).map_err(|error| {
            WikidotError::Storage(format!("failed to write {}: {error}", self.name()))
        })
    }

    fn selections(&self) -> Vec<MergeSelection> {
        self.selections.clone()
    }
}

/// Line-oriented prompts on stdin/stderr. An empty answer dismisses.
/// Secret prompts read from the terminal with echo disabled.
struct StdioPrompter {
    read_plain: fn(&str) -> io::Result<String>,
    read_secret: fn(&str) -> io::Result<String>,
}

impl Default for StdioPrompter {
    fn default() -> Self {
        Self {
            read_plain: read_stdin_line,
            read_secret: read_terminal_secret,
        }
    }
}

fn read_terminal_secret(prompt: &str) -> io::Result<String> {
    rpassword::prompt_password(prompt)
}

fn read_stdin_line(prompt: &str) -> io::Result<String> {
    eprint!("{prompt}");
    io::stderr().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

impl StdioPrompter {
    fn read_line(&self, prompt: &str) -> Option<String> {
        (self.read_plain)(prompt).ok()
    }
}

impl Prompter for StdioPrompter {
    fn input(&self, request: &InputRequest<'_>) -> Option<String> {
        if request.secret {
            let answer = (self.read_secret)(&format!("{}: ", request.prompt)).ok()?;
            return Some(answer).filter(|answer| !answer.is_empty());
        }
        let hint = match request.value.or(request.placeholder) {
            Some(hint) => format!(" [{hint}]"),
            None => String::new(),
        };
        let answer = self.read_line(&format!("{}{hint}: ", request.prompt))?;
        if answer.is_empty() {
            return request.value.map(ToString::to_string);
        }
        Some(answer)
    }

    fn choose(&self, message: &str, options: &[&str]) -> Option<usize> {
        eprintln!("{message}");
        for (index, option) in options.iter().enumerate() {
            eprintln!("  {}) {option}", index + 1);
        }
        let answer = self.read_line("> ")?;
        match answer.trim().parse::<usize>() {
            Ok(choice) if (1..=options.len()).contains(&choice) => Some(choice - 1),
            _ => None,
        }
    }

    fn info(&self, message: &str) {
        eprintln!("{message}");
    }

    fn warn(&self, message: &str) {
        eprintln!("warning: {message}");
    }
}

fn format_revision(revision: Option<u64>) -> String {
    revision
        .map(|revision| revision.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
