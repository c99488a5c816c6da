use adminq::admin::types::{Role, UserFilter};
use adminq::admin::AdminService;
use adminq::config::Config;
use adminq::logging;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "adminq")]
#[command(about = "Admin console data client with an optimistic query cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/adminq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Manage user accounts
  #[command(subcommand)]
  Users(UsersCommand),
  /// Browse and delete categorization uploads
  #[command(subcommand)]
  Categorizations(CategorizationsCommand),
  /// Show the current configuration
  #[command(subcommand)]
  Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum UsersCommand {
  /// List users
  List {
    /// Only users with this role (admin or user)
    #[arg(long)]
    role: Option<String>,
    /// Only enabled (true) or disabled (false) accounts
    #[arg(long)]
    enabled: Option<bool>,
    /// Free-text search on name and email
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    page: Option<u32>,
  },
  /// Show a single user
  Show { id: String },
  /// Enable a user account
  Enable { id: String },
  /// Disable a user account
  Disable { id: String },
  /// Delete a user account
  Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum CategorizationsCommand {
  /// List uploaded files
  List {
    #[arg(long, default_value_t = 1)]
    page: u32,
  },
  /// Delete an upload
  Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
  /// Print the configuration stored on the server
  Show,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn parse_role(role: &str) -> Result<Role> {
  Role::from_name(&role.to_lowercase()).ok_or_else(|| eyre!("Unknown role: {}", role))
}

async fn run(service: &AdminService, command: Command) -> Result<()> {
  match command {
    Command::Users(cmd) => match cmd {
      UsersCommand::List {
        role,
        enabled,
        search,
        page,
      } => {
        let filter = UserFilter {
          role: role.as_deref().map(parse_role).transpose()?,
          enabled,
          search,
          page,
        };
        print_json(&service.users(&filter).await?)
      }
      UsersCommand::Show { id } => print_json(&service.user(&id).await?),
      UsersCommand::Enable { id } => print_json(&service.set_user_enabled(&id, true).await?),
      UsersCommand::Disable { id } => print_json(&service.set_user_enabled(&id, false).await?),
      UsersCommand::Delete { id } => print_json(&service.delete_user(&id).await?),
    },
    Command::Categorizations(cmd) => match cmd {
      CategorizationsCommand::List { page } => print_json(&service.categorizations(page).await?),
      CategorizationsCommand::Delete { id } => {
        print_json(&service.delete_categorization(&id).await?)
      }
    },
    Command::Config(ConfigCommand::Show) => print_json(&service.configuration().await?),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let service = AdminService::from_config(&config)?;
  let result = run(&service, args.command).await;
  service.store().dispose();

  result
}
