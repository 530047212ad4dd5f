use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use edittool_core::cache::OptionsCache;
use edittool_core::config::load_config;
use edittool_core::hierarchy::{HierarchySnapshot, KindFilter, resolve_root};
use edittool_core::migrate::{pending_migration_count, run_migrations};
use edittool_core::model::ModelLibrary;
use edittool_core::options::{FormOptionSet, OptionValue};
use edittool_core::panel::{bind_model, child_identifiers};
use edittool_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready,
    init_layout, inspect_runtime, resolve_paths,
};
use edittool_core::store::{
    StoredPageStats, load_index_stats, rebuild_index, resolve_root_stored, scan_page_records,
};

#[derive(Debug, Parser)]
#[command(
    name = "edittool",
    version,
    about = "Form option merging and chooser tooling for model-driven page trees"
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
    Models(ModelsArgs),
    Form(FormArgs),
    Chooser(ChooserArgs),
    Index(IndexArgs),
    Db(DbArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .edittool/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct ModelsArgs {
    #[command(subcommand)]
    command: ModelsSubcommand,
}

#[derive(Debug, Subcommand)]
enum ModelsSubcommand {
    List,
    Show { model: String },
}

#[derive(Debug, Args)]
struct FormArgs {
    #[command(subcommand)]
    command: FormSubcommand,
}

#[derive(Debug, Subcommand)]
enum FormSubcommand {
    Options {
        model: String,
        #[arg(long, help = "Emit the merged option set as JSON")]
        json: bool,
    },
    Identifiers {
        model: String,
    },
}

#[derive(Debug, Args)]
struct ChooserArgs {
    #[command(subcommand)]
    command: ChooserSubcommand,
}

#[derive(Debug, Subcommand)]
enum ChooserSubcommand {
    Root {
        #[arg(long = "kind", value_name = "KIND", help = "Restrict to pages of this kind (repeatable)")]
        kinds: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct IndexArgs {
    #[command(subcommand)]
    command: IndexSubcommand,
}

#[derive(Debug, Subcommand)]
enum IndexSubcommand {
    Rebuild,
    Stats,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Models(ModelsArgs { command })) => match command {
            ModelsSubcommand::List => run_models_list(&runtime),
            ModelsSubcommand::Show { model } => run_models_show(&runtime, &model),
        },
        Some(Commands::Form(FormArgs { command })) => match command {
            FormSubcommand::Options { model, json } => run_form_options(&runtime, &model, json),
            FormSubcommand::Identifiers { model } => run_form_identifiers(&runtime, &model),
        },
        Some(Commands::Chooser(ChooserArgs { command })) => match command {
            ChooserSubcommand::Root { kinds } => run_chooser_root(&runtime, kinds),
        },
        Some(Commands::Index(IndexArgs { command })) => match command {
            IndexSubcommand::Rebuild => run_index_rebuild(&runtime),
            IndexSubcommand::Stats => run_index_stats(&runtime),
        },
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized edittool runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("models_dir: {}", normalize_path(&paths.models_dir));
    println!("pages_dir: {}", normalize_path(&paths.pages_dir));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
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
    let library = ModelLibrary::load(&paths.models_dir)?;
    let declared_pages = scan_page_records(&paths.pages_dir)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("models_exists: {}", format_flag(status.models_exists));
    println!("pages_exists: {}", format_flag(status.pages_exists));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("models.count: {}", library.len());
    println!("pages.declared: {}", declared_pages.len());
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

fn run_models_list(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let library = ModelLibrary::load(&paths.models_dir)?;

    println!("models list");
    println!("models_dir: {}", normalize_path(&paths.models_dir));
    println!("models.count: {}", library.len());
    for name in library.names() {
        let schema = library
            .schema(name)
            .ok_or_else(|| anyhow::anyhow!("model `{name}` disappeared from the library"))?;
        println!(
            "models.{name}: fields={} relations={} panels={}",
            schema.fields.len(),
            schema.relations.len(),
            schema.panels.len()
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_models_show(runtime: &RuntimeOptions, model: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let library = ModelLibrary::load(&paths.models_dir)?;
    let Some(schema) = library.schema(model) else {
        bail!("model `{model}` is not defined under {}", normalize_path(&paths.models_dir));
    };

    println!("model {model}");
    println!("verbose_name: {}", schema.verbose_name());
    println!(
        "extends: {}",
        schema.extends.as_deref().unwrap_or("<none>")
    );
    println!(
        "source_hash: {}",
        library.source_hash(model).unwrap_or("<unknown>")
    );
    for field in &schema.fields {
        println!(
            "field.{}: kind={} required={} widget={}",
            field.name,
            field.kind.as_str(),
            field.required,
            field.widget.as_deref().unwrap_or("<default>")
        );
    }
    for relation in &schema.relations {
        println!("relation.{}: target={}", relation.name, relation.target);
    }
    println!("panels.count: {}", schema.panels.len());
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_form_options(runtime: &RuntimeOptions, model: &str, json: bool) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let library = ModelLibrary::load(&paths.models_dir)?;
    let defaults = config.widget_defaults();

    let mut cache = OptionsCache::new();
    let options = cache.get_or_merge(&library, &defaults, model)?;

    if json {
        println!("{}", serde_json::to_string_pretty(options)?);
    } else {
        println!("form options for {model}");
        print_option_set("options", options);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_form_identifiers(runtime: &RuntimeOptions, model: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let library = ModelLibrary::load(&paths.models_dir)?;
    let form = bind_model(&library, &config.widget_defaults(), model)?;
    let identifiers = child_identifiers(&form.panels);

    println!("form identifiers for {model}");
    println!("identifiers.count: {}", identifiers.len());
    for identifier in identifiers {
        println!("identifiers.child: {identifier}");
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_chooser_root(runtime: &RuntimeOptions, kinds: Vec<String>) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let library = ModelLibrary::load(&paths.models_dir)?;
    let graph = library.kind_graph();
    let filter = KindFilter::from_kinds(kinds);

    println!("chooser root");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!(
        "filter: {}",
        if filter.is_any() { "<any>" } else { "kinds" }
    );

    // the stored index is authoritative when present; fall back to reading
    // the page declarations directly
    let resolved = match resolve_root_stored(&paths, &filter, &graph)? {
        Some(page) => {
            println!("source: index");
            page
        }
        None => {
            let records = scan_page_records(&paths.pages_dir)?;
            if records.is_empty() {
                bail!(
                    "no page index and no page declarations under {}; run `edittool init` and declare pages first",
                    normalize_path(&paths.pages_dir)
                );
            }
            let snapshot = HierarchySnapshot::from_records(records)?;
            println!("source: declarations");
            resolve_root(&snapshot, &filter, &graph).clone()
        }
    };

    println!("root.id: {}", resolved.id);
    println!("root.kind: {}", resolved.kind);
    println!("root.title: {}", resolved.title);
    println!("root.slug: {}", resolved.slug);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_index_rebuild(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready(&paths, &status)?;

    let report = rebuild_index(&paths)?;

    println!("index rebuild");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("db_path: {}", report.db_path);
    println!("indexed_pages: {}", report.indexed_pages);
    println!("max_depth: {}", report.max_depth);
    for (kind, count) in &report.by_kind {
        println!("kind.{kind}: {count}");
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_index_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let stored = load_index_stats(&paths)?;

    println!("index stats");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("pages_dir: {}", normalize_path(&paths.pages_dir));
    match stored {
        Some(stored) => print_stored_stats("index", &stored),
        None => println!("index.storage: <not built> (run `edittool index rebuild`)"),
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("applied.count: {}", report.applied.len());
    for migration in &report.applied {
        println!("applied: v{:03}_{}", migration.version, migration.name);
    }
    println!("current_version: {}", report.current_version);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let stored = load_index_stats(&paths)?;
    let pending = pending_migration_count(&paths)?;

    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("migrations.pending: {pending}");
    match stored {
        Some(stored) => print_stored_stats("index", &stored),
        None => println!("index.storage: <not built> (run `edittool index rebuild`)"),
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn print_option_set(prefix: &str, options: &FormOptionSet) {
    if options.is_empty() {
        println!("{prefix}: <empty>");
        return;
    }
    for (category, value) in options.categories() {
        match value {
            OptionValue::Sequence(items) => {
                println!("{prefix}.{category}: {}", items.join(", "));
            }
            OptionValue::Mapping(entries) => {
                for (key, entry) in entries {
                    println!("{prefix}.{category}.{key}: {entry}");
                }
            }
            OptionValue::Nested(children) => {
                for (key, child) in children {
                    print_option_set(&format!("{prefix}.{category}.{key}"), child);
                }
            }
        }
    }
}

fn print_stored_stats(prefix: &str, stats: &StoredPageStats) {
    println!("{prefix}.indexed_pages: {}", stats.indexed_pages);
    println!("{prefix}.max_depth: {}", stats.max_depth);
    if stats.by_kind.is_empty() {
        println!("{prefix}.by_kind: <empty>");
    } else {
        for (kind, count) in &stats.by_kind {
            println!("{prefix}.kind.{kind}: {count}");
        }
    }
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

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
