use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use station_query::backend::{RestClient, RestService, SqliteService, SqliteStore};
use station_query::config::{BackendConfig, Config};
use station_query::logging;
use station_query::query::{Filters, Query, QueryClient};
use station_query::resource::{
  create_resource_hooks, Record, ResourceService, ResourceSummary, UpdateInput,
};

#[derive(Parser, Debug)]
#[command(name = "station-query")]
#[command(about = "Query and edit petrol station resources through the cached data layer")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/station-query/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List records, optionally filtered by field equality
  List {
    resource: String,
    /// Filter as field=value; the value is parsed as JSON when possible
    #[arg(short, long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, Value)>,
  },
  /// Show one record
  Get { resource: String, id: String },
  /// Create a record from a JSON object
  Create { resource: String, data: String },
  /// Merge a JSON object into a record
  Update {
    resource: String,
    id: String,
    data: String,
  },
  /// Delete a record
  Delete { resource: String, id: String },
  /// Show aggregate figures
  Summary { resource: String },
}

impl Command {
  fn resource(&self) -> &str {
    match self {
      Command::List { resource, .. }
      | Command::Get { resource, .. }
      | Command::Create { resource, .. }
      | Command::Update { resource, .. }
      | Command::Delete { resource, .. }
      | Command::Summary { resource } => resource,
    }
  }
}

fn parse_filter(s: &str) -> Result<(String, Value), String> {
  let (field, raw) = s
    .split_once('=')
    .ok_or_else(|| format!("expected field=value, got `{}`", s))?;
  let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
  Ok((field.to_string(), value))
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON payload: {}", e))
}

fn print<T: Serialize>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}

/// Mount a query, wait for it and hand back its data.
async fn resolve<T>(mut query: Query<T>) -> Result<T>
where
  T: Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
{
  query.fetch();
  query.settled().await;
  if let Some(error) = query.error() {
    return Err(eyre!("{}", error));
  }
  query
    .data()
    .cloned()
    .ok_or_else(|| eyre!("Query for {} returned no data", query.key()))
}

async fn run<S>(client: &QueryClient, service: S, command: Command) -> Result<()>
where
  S: ResourceService<Entity = Record, Create = Value, Update = Value, Summary = ResourceSummary>,
{
  let hooks = create_resource_hooks(client, command.resource(), service)?;

  match command {
    Command::List { filters, .. } => {
      let filters: Filters = filters.into_iter().collect();
      let filters = (!filters.is_empty()).then_some(filters);
      let records = resolve(hooks.use_list(filters)).await?;
      info!(resource = hooks.resource_name(), count = records.len(), "listed");
      print(&records)
    }
    Command::Get { id, .. } => print(&resolve(hooks.use_by_id(Some(&id))).await?),
    Command::Create { data, .. } => {
      let created = hooks.use_create().mutate_async(parse_json(&data)?).await?;
      info!(resource = hooks.resource_name(), id = %station_query::Entity::id(&created), "created");
      print(&created)
    }
    Command::Update { id, data, .. } => {
      let input = UpdateInput::new(id, parse_json(&data)?);
      let updated = hooks.use_update().mutate_async(input).await?;
      print(&updated)
    }
    Command::Delete { id, .. } => {
      hooks.use_delete().mutate_async(id.clone()).await?;
      info!(resource = hooks.resource_name(), id = %id, "deleted");
      Ok(())
    }
    Command::Summary { .. } => {
      let query = hooks
        .use_summary()
        .ok_or_else(|| eyre!("{} has no summary", hooks.resource_name()))?;
      print(&resolve(query).await?)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let _guard = if args.verbose {
    logging::init_stderr()?;
    None
  } else {
    let dir = match &config.log_dir {
      Some(dir) => dir.clone(),
      None => logging::default_log_dir()?,
    };
    Some(logging::init_file(&dir)?)
  };

  let client = QueryClient::new(config.cache.options());
  let resource = args.command.resource().to_string();

  match &config.backend {
    BackendConfig::Sqlite { path } => {
      let store = match path {
        Some(path) => SqliteStore::open_at(path)?,
        None => SqliteStore::open()?,
      };
      let service = SqliteService::<Record>::new(Arc::new(store), resource);
      run(&client, service, args.command).await
    }
    BackendConfig::Rest { url } => {
      let rest = RestClient::new(url, &Config::get_api_key()?)?;
      let service = RestService::<Record>::new(rest, resource);
      run(&client, service, args.command).await
    }
  }
}
