//! EMS CLI - Command-line interface for translating and running EMS flight queries.

use clap::{Parser, Subcommand};
use emsapi::{cache, find_database, Aggregate, Config, Connection, FieldTree, FltQuery, MetadataStore, SearchType};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ems")]
#[command(author, version, about = "Query EMS flight data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the API filter JSON for an expression
    Translate {
        /// Field tree JSON file
        #[arg(short, long)]
        metadata: PathBuf,

        /// Filter expression, e.g. "'Flight Record' > 17000"
        expr: String,
    },

    /// Look up a field by keyword
    Fields {
        /// Field tree JSON file
        #[arg(short, long)]
        metadata: PathBuf,

        /// Keyword to search for
        keyword: String,
    },

    /// Run a query against a database
    Query {
        /// Field tree JSON file of the database
        #[arg(short, long)]
        metadata: PathBuf,

        /// EMS system name or id; may be left out when the account has one
        #[arg(long)]
        ems: Option<String>,

        /// Fields to select
        #[arg(short, long, required = true)]
        select: Vec<String>,

        /// Filter expressions, combined with `and`
        #[arg(short, long)]
        filter: Vec<String>,

        /// Aggregation for the selected fields
        #[arg(short, long, default_value = "none")]
        aggregate: Aggregate,

        /// Maximum number of rows
        #[arg(short, long)]
        top: Option<u32>,

        /// Output file (CSV or Parquet based on extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Show the query JSON without sending it
        #[arg(long)]
        dry_run: bool,
    },

    /// Fetch a database's field tree and write it to a JSON file
    Schema {
        /// Database name or bracketed id, e.g. "FDW Flights"
        #[arg(short, long)]
        database: String,

        /// EMS system name or id; may be left out when the account has one
        #[arg(long)]
        ems: Option<String>,

        /// Field group path to descend, one keyword per level
        #[arg(short, long)]
        group: Vec<String>,

        /// Also fetch the value maps of discrete fields
        #[arg(long)]
        discrete: bool,

        /// Ignore a cached tree and fetch again
        #[arg(long)]
        refresh: bool,

        /// Output JSON file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// List the EMS systems of this account
    Systems,

    /// Show or clear cached field trees
    Cache {
        /// Remove all cached trees
        #[arg(long)]
        clear: bool,
    },

    /// Configure EMS credentials
    Config {
        /// EMS username
        #[arg(short, long)]
        username: Option<String>,

        /// EMS password
        #[arg(short, long)]
        password: Option<String>,

        /// Server name (prod, cluster, stable, beta, nightly)
        #[arg(long)]
        server: Option<String>,

        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Translate { metadata, expr } => {
            let tree = FieldTree::load(&metadata)?;
            let node = emsapi::build_filter(&expr, &tree)?.into_predicate();
            println!("{}", serde_json::to_string_pretty(&node)?);
        }

        Commands::Fields { metadata, keyword } => {
            let tree = FieldTree::load(&metadata)?;
            let field = tree.search_field(&keyword)?;
            println!("{} ({})", field.name, field.field_type);
            println!("  {}", field.id);
        }

        Commands::Query {
            metadata,
            ems,
            select,
            filter,
            aggregate,
            top,
            output,
            dry_run,
        } => {
            let tree = FieldTree::load(&metadata)?;
            let mut conn = None;
            let ems_id = if dry_run {
                // Nothing is sent, so a name is not resolved.
                ems.as_deref().and_then(|e| e.parse().ok()).unwrap_or(0)
            } else {
                let c = conn.insert(Connection::new().await?);
                c.ems_id(ems.as_deref()).await?
            };
            let mut query = FltQuery::new(ems_id, tree.database_id(), &tree);

            let fields: Vec<&str> = select.iter().map(String::as_str).collect();
            query.select(&fields, aggregate)?;
            for expr in &filter {
                query.filter(expr)?;
            }
            if let Some(n) = top {
                query.top(n);
            }

            if dry_run {
                println!("{}", serde_json::to_string_pretty(query.queryset())?);
                return Ok(());
            }

            let mut conn = match conn {
                Some(c) => c,
                None => Connection::new().await?,
            };
            let data = query.run(&mut conn).await?;

            let row_count = data.len();
            println!("Retrieved {} rows", row_count);

            if row_count == 0 {
                println!("No flights matched.");
                return Ok(());
            }

            match output {
                Some(path) => {
                    match path.extension().and_then(|e| e.to_str()) {
                        Some("parquet") => data.to_parquet(&path)?,
                        _ => data.to_csv(&path)?,
                    }
                    println!("Saved to {}", path.display());
                }
                None => {
                    println!("\n{}", data.dataframe().head(Some(10)));
                    if row_count > 10 {
                        println!("... ({} more rows)", row_count - 10);
                    }
                }
            }
        }

        Commands::Schema {
            database,
            ems,
            group,
            discrete,
            refresh,
            output,
        } => {
            let mut conn = Connection::new().await?;
            let ems_id = conn.ems_id(ems.as_deref()).await?;
            let database_id = find_database(&mut conn, ems_id, &database, SearchType::Contain).await?;

            let cached = if refresh {
                None
            } else {
                cache::get_cached(conn.uri_root(), ems_id, &database_id, None)
            };
            let mut tree = cached.unwrap_or_else(|| FieldTree::new(database_id.as_str()));

            let path: Vec<&str> = group.iter().map(String::as_str).collect();
            tree.fetch_path(&mut conn, ems_id, &path).await?;
            if discrete {
                let fetched = tree.fetch_missing_discrete_values(&mut conn, ems_id).await?;
                println!("Fetched value maps of {} discrete fields", fetched);
            }

            cache::save_to_cache(conn.uri_root(), ems_id, &tree)?;
            tree.save(&output)?;
            println!(
                "Saved {} fields of {} to {}",
                tree.fields().count(),
                database_id,
                output.display()
            );
        }

        Commands::Systems => {
            let mut conn = Connection::new().await?;
            for system in conn.ems_systems().await? {
                println!(
                    "{:>4}  {}  {}",
                    system.id,
                    system.name,
                    system.description.unwrap_or_default()
                );
            }
        }

        Commands::Cache { clear } => {
            if clear {
                let removed = cache::clear_cache()?;
                println!("Removed {} cached field trees.", removed);
                return Ok(());
            }
            let stats = cache::cache_stats()?;
            println!("Cache directory: {}", stats.directory.display());
            println!("  Field trees: {}", stats.file_count);
            println!("  Size: {}", stats.size_human());
        }

        Commands::Config {
            username,
            password,
            server,
            show,
        } => {
            let path = Config::config_path()?;

            if show {
                match Config::load_from_path(&path) {
                    Ok(config) => {
                        println!("EMS Configuration ({}):", path.display());
                        println!("  Username: {}", config.username.clone().unwrap_or_default());
                        println!(
                            "  Password: {}",
                            if config.password.is_some() {
                                "********"
                            } else {
                                "(not set)"
                            }
                        );
                        println!("  Server: {}", config.uri_root().unwrap_or_else(|e| e.to_string()));
                        println!("  Max trials: {}", config.max_trials());
                    }
                    Err(_) => {
                        println!("No configuration found. Use --username and --password to set.");
                    }
                }
                return Ok(());
            }

            if username.is_none() && password.is_none() && server.is_none() {
                if !path.exists() {
                    if let Some(dir) = path.parent() {
                        std::fs::create_dir_all(dir)?;
                    }
                    std::fs::write(&path, emsapi::config::DEFAULT_CONFIG)?;
                    println!("Created {}", path.display());
                }
                println!("Use --username and --password to set credentials, or --show to view.");
                return Ok(());
            }

            let mut config = Config::load_from_path(&path).unwrap_or_default();
            if let Some(u) = username {
                config.username = Some(u);
            }
            if let Some(p) = password {
                config.password = Some(p);
            }
            if let Some(s) = server {
                config.server = Some(s);
                config.uri_root()?;
            }

            config.save_to_path(&path)?;
            println!("Configuration saved.");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_command_args() {
        let cli = Cli::try_parse_from([
            "ems",
            "schema",
            "--database",
            "FDW Flights",
            "--ems",
            "ACME",
            "-g",
            "Flight Information",
            "-g",
            "Identification",
            "--discrete",
            "-o",
            "flights.json",
        ])
        .unwrap();

        match cli.command {
            Commands::Schema {
                database,
                ems,
                group,
                discrete,
                refresh,
                output,
            } => {
                assert_eq!(database, "FDW Flights");
                assert_eq!(ems.as_deref(), Some("ACME"));
                assert_eq!(group, vec!["Flight Information", "Identification"]);
                assert!(discrete);
                assert!(!refresh);
                assert_eq!(output, PathBuf::from("flights.json"));
            }
            _ => panic!("expected the schema command"),
        }
    }

    #[test]
    fn test_schema_command_needs_output() {
        assert!(Cli::try_parse_from(["ems", "schema", "--database", "FDW Flights"]).is_err());
    }

    #[test]
    fn test_query_accepts_ems_name() {
        let cli = Cli::try_parse_from(["ems", "query", "-m", "flights.json", "--ems", "ACME", "-s", "Flight Record"])
            .unwrap();
        match cli.command {
            Commands::Query { ems, .. } => assert_eq!(ems.as_deref(), Some("ACME")),
            _ => panic!("expected the query command"),
        }
    }
}
