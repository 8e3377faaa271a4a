//! Human-facing rendering of entities and events.

use lattice_lab_proto::{threat_level, Entity, EntityEvent, EntityType, EventType, ThreatLevel};
use owo_colors::OwoColorize;
use prost_types::Timestamp;

pub fn human_error(status: tonic::Status) -> anyhow::Error {
    anyhow::anyhow!("{}: {}", code_name(status.code()), status.message())
}

fn code_name(code: tonic::Code) -> &'static str {
    match code {
        tonic::Code::NotFound => "not found",
        tonic::Code::AlreadyExists => "already exists",
        tonic::Code::InvalidArgument => "invalid argument",
        tonic::Code::FailedPrecondition => "failed precondition",
        tonic::Code::Unimplemented => "unsupported here",
        tonic::Code::Unavailable => "store unreachable",
        _ => "error",
    }
}

pub fn print_entity_table(entities: &[Entity]) {
    println!("{:<24} {:<8} {:<40} {}", "ID", "TYPE", "COMPONENTS", "HLC");
    for entity in entities {
        let mut components: Vec<&str> =
            entity.components.keys().map(String::as_str).collect();
        components.sort_unstable();
        println!(
            "{:<24} {:<8} {:<40} {}.{}",
            entity.id,
            type_name(entity.r#type()),
            components.join(","),
            entity.hlc_physical,
            entity.hlc_logical,
        );
    }
}

pub fn print_entity_detail(entity: &Entity) {
    println!("id:       {}", entity.id);
    println!("type:     {}", type_name(entity.r#type()));
    println!("created:  {}", format_timestamp(entity.created_at.as_ref()));
    println!("updated:  {}", format_timestamp(entity.updated_at.as_ref()));
    println!(
        "hlc:      {}.{}@{}",
        entity.hlc_physical, entity.hlc_logical, entity.hlc_node
    );
    println!("components:");
    let mut keys: Vec<&String> = entity.components.keys().collect();
    keys.sort_unstable();
    for key in keys {
        println!("  {:<16} {}", key, entity.components[key].type_url);
    }
    let threat = threat_level(entity);
    if threat != ThreatLevel::Unspecified {
        println!("threat:   {}", colored_threat(threat));
    }
}

pub fn print_event(event: &EntityEvent) {
    let Some(entity) = event.entity.as_ref() else {
        return;
    };
    let kind = match event.r#type() {
        EventType::Created => "CREATED".green().to_string(),
        EventType::Updated => "UPDATED".to_string(),
        EventType::Deleted => "DELETED".red().to_string(),
        EventType::Unspecified => "?".to_string(),
    };
    println!(
        "{:<16} {:<24} {:<8} origin={} threat={}",
        kind,
        entity.id,
        type_name(entity.r#type()),
        event.origin_node,
        colored_threat(threat_level(entity)),
    );
}

fn colored_threat(threat: ThreatLevel) -> String {
    match threat {
        ThreatLevel::High => threat.to_string().red().bold().to_string(),
        ThreatLevel::Medium => threat.to_string().yellow().to_string(),
        ThreatLevel::Low => threat.to_string().cyan().to_string(),
        _ => threat.to_string(),
    }
}

fn type_name(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Unspecified => "-",
        EntityType::Asset => "asset",
        EntityType::Track => "track",
        EntityType::Geo => "geo",
    }
}

fn format_timestamp(ts: Option<&Timestamp>) -> String {
    match ts {
        Some(ts) => format!("{}s.{:09}", ts.seconds, ts.nanos),
        None => "-".to_string(),
    }
}
