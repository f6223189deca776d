use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

use rescache::fetch::{self, Operation};
use rescache::{
  telemetry, Config, Entity, EntityId, FieldDelta, Fetcher, HttpFetcher, LifecycleView,
  MutationCoordinator, QueryKey, QuerySurface, ResourceCache, ResourceType, SortField,
};

#[derive(Parser, Debug)]
#[command(name = "rescache")]
#[command(about = "Browse and edit admin API resources through the consistency cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rescache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List one page of a resource
  List {
    resource: ResourceType,
    #[arg(long, default_value_t = 1)]
    page: u32,
    /// Rows per page (default from config)
    #[arg(long)]
    size: Option<u32>,
    /// Show the trash instead of active rows
    #[arg(long)]
    trash: bool,
    #[arg(long)]
    search: Option<String>,
    /// field[:asc|:desc], may be repeated
    #[arg(long)]
    sort: Vec<SortField>,
    /// field=value, may be repeated
    #[arg(long, value_parser = parse_assignment)]
    filter: Vec<(String, String)>,
  },
  /// Create an entity from field=value pairs
  Create {
    resource: ResourceType,
    #[arg(value_parser = parse_assignment)]
    fields: Vec<(String, String)>,
  },
  /// Update fields of an entity
  Update {
    resource: ResourceType,
    id: i64,
    #[arg(value_parser = parse_assignment, required = true)]
    fields: Vec<(String, String)>,
  },
  /// Move an entity to the trash
  Trash { resource: ResourceType, id: i64 },
  /// Bring an entity back from the trash
  Restore { resource: ResourceType, id: i64 },
  /// Delete an entity permanently
  Purge { resource: ResourceType, id: i64 },
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
  match s.split_once('=') {
    Some((field, value)) if !field.trim().is_empty() => Ok((field.trim().to_string(), value.to_string())),
    _ => Err(format!("expected field=value, got '{}'", s)),
  }
}

/// Values that parse as JSON keep their type; anything else is a string.
fn field_value(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

struct Session {
  config: Config,
  fetcher: Arc<dyn Fetcher>,
  surface: QuerySurface,
  coordinator: MutationCoordinator,
}

impl Session {
  fn new(config: Config) -> Result<Self> {
    let cache = Arc::new(ResourceCache::new());
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&config.api)?);
    let surface = QuerySurface::from_config(cache.clone(), fetcher.clone(), &config);
    let coordinator = MutationCoordinator::from_config(cache, fetcher.clone(), &config);
    Ok(Self {
      config,
      fetcher,
      surface,
      coordinator,
    })
  }

  /// Current server copy, needed to validate lifecycle transitions.
  async fn fetch_entity(&self, resource: ResourceType, id: EntityId) -> Result<Entity> {
    let timeout = self.config.cache.request_timeout();
    let payload = fetch::dispatch(self.fetcher.as_ref(), timeout, resource, Operation::Get(id)).await?;
    payload
      .into_entity()
      .ok_or_else(|| eyre!("{} {} was not returned by the server", resource, id))
  }

  async fn run(&self, command: Command) -> Result<()> {
    match command {
      Command::List {
        resource,
        page,
        size,
        trash,
        search,
        sort,
        filter,
      } => {
        let page_size = size.unwrap_or_else(|| self.config.resource(resource).page_size);
        let mut key = QueryKey::new(resource).with_page(page).with_page_size(page_size);
        if trash {
          key = key.with_view(LifecycleView::Trashed);
        }
        if let Some(term) = search {
          key = key.with_search(term);
        }
        for field in sort {
          key = key.with_sort(field);
        }
        for (field, value) in filter {
          key = key.with_filter(field, value);
        }
        let result = self.surface.query(&key).await?;
        print_json(&result)
      }
      Command::Create { resource, fields } => {
        let payload: Map<String, Value> = fields.iter().map(|(f, v)| (f.clone(), field_value(v))).collect();
        let created = self.coordinator.create(resource, payload, None).await?;
        print_json(&created)
      }
      Command::Update { resource, id, fields } => {
        let delta = fields
          .iter()
          .fold(FieldDelta::new(), |delta, (f, v)| delta.set(f.clone(), field_value(v)));
        let updated = self.coordinator.update(resource, EntityId(id), delta).await?;
        print_json(&updated)
      }
      Command::Trash { resource, id } => {
        let entity = self.fetch_entity(resource, EntityId(id)).await?;
        print_json(&self.coordinator.soft_delete(&entity).await?)
      }
      Command::Restore { resource, id } => {
        let entity = self.fetch_entity(resource, EntityId(id)).await?;
        print_json(&self.coordinator.restore(&entity).await?)
      }
      Command::Purge { resource, id } => {
        let entity = self.fetch_entity(resource, EntityId(id)).await?;
        self.coordinator.hard_delete(&entity).await?;
        print_json(&serde_json::json!({ "purged": id, "resource": resource }))
      }
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Keep the guard alive so file logs are flushed on exit
  let _log_guard = telemetry::init(&config.logging)?;

  let session = Session::new(config)?;
  session.run(args.command).await
}
