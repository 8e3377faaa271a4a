//! Operator CLI for Lattice-Lab
//!
//! Inspect and steer a node's entity store: list/get entities, follow the
//! watch stream, and approve or deny pending intercepts.

mod display;

use clap::{Parser, Subcommand};
use lattice_lab_proto::{
    ApproveActionRequest, DenyActionRequest, EntityStoreServiceClient, EntityType,
    GetEntityRequest, ListEntitiesRequest, WatchEntitiesRequest,
};
use tonic::transport::{Channel, Endpoint};

#[derive(Parser)]
#[command(name = "lattice-lab", version, about = "Operator interface for Lattice-Lab")]
struct Cli {
    /// Entity store address
    #[arg(long, global = true, default_value = "127.0.0.1:50051")]
    store: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List entities
    List {
        /// Filter by type (track, asset, geo)
        #[arg(short = 't', long = "type")]
        type_filter: Option<String>,
    },
    /// Show one entity in detail
    Get { id: String },
    /// Follow the live event stream
    Watch {
        /// Filter by type (track, asset, geo)
        #[arg(short = 't', long = "type")]
        type_filter: Option<String>,
    },
    /// Approve a pending intercept
    Approve { id: String },
    /// Deny a pending intercept
    Deny { id: String },
}

fn parse_type(filter: Option<&str>) -> anyhow::Result<EntityType> {
    match filter {
        None => Ok(EntityType::Unspecified),
        Some("track") => Ok(EntityType::Track),
        Some("asset") => Ok(EntityType::Asset),
        Some("geo") => Ok(EntityType::Geo),
        Some(other) => anyhow::bail!("unknown type {other:?} (expected track, asset or geo)"),
    }
}

async fn dial(addr: &str) -> anyhow::Result<EntityStoreServiceClient<Channel>> {
    let channel = Endpoint::from_shared(format!("http://{addr}"))?
        .connect_lazy();
    Ok(EntityStoreServiceClient::new(channel))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut client = dial(&cli.store).await?;

    match cli.command {
        Command::List { type_filter } => {
            let filter = parse_type(type_filter.as_deref())?;
            let response = client
                .list_entities(ListEntitiesRequest {
                    type_filter: filter as i32,
                })
                .await
                .map_err(display::human_error)?
                .into_inner();
            display::print_entity_table(&response.entities);
        }
        Command::Get { id } => {
            let entity = client
                .get_entity(GetEntityRequest { id })
                .await
                .map_err(display::human_error)?
                .into_inner();
            display::print_entity_detail(&entity);
        }
        Command::Watch { type_filter } => {
            let filter = parse_type(type_filter.as_deref())?;
            let mut stream = client
                .watch_entities(WatchEntitiesRequest {
                    type_filter: filter as i32,
                })
                .await
                .map_err(display::human_error)?
                .into_inner();

            println!("watching {} (ctrl-c to stop)...", cli.store);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    message = stream.message() => match message {
                        Ok(Some(event)) => display::print_event(&event),
                        Ok(None) => break,
                        Err(status) => return Err(display::human_error(status)),
                    },
                }
            }
        }
        Command::Approve { id } => {
            let entity = client
                .approve_action(ApproveActionRequest { entity_id: id })
                .await
                .map_err(display::human_error)?
                .into_inner();
            println!("approved intercept for {}", entity.id);
            display::print_entity_detail(&entity);
        }
        Command::Deny { id } => {
            let entity = client
                .deny_action(DenyActionRequest { entity_id: id })
                .await
                .map_err(display::human_error)?
                .into_inner();
            println!("denied intercept for {}", entity.id);
        }
    }

    Ok(())
}
