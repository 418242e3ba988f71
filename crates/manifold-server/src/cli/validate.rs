// crates/manifold-server/src/cli/validate.rs
// Profile and environment validation

use anyhow::Result;
use manifold::config::{self, DownstreamDefinition, EnvConfig, Profile};

pub fn run(profile_name: &str) -> Result<()> {
    let env_config = EnvConfig::load();
    let validation = env_config.validate();
    println!("{}", validation.report());

    let path = config::profile_path(profile_name);
    let profile = Profile::load(&path)?;

    println!(
        "\nProfile '{}' OK ({} downstream{}):",
        profile_name,
        profile.downstreams.len(),
        if profile.downstreams.len() == 1 { "" } else { "s" }
    );
    for entry in &profile.downstreams {
        let shape = match &entry.definition {
            DownstreamDefinition::Process { command, .. } => format!("process: {command}"),
            DownstreamDefinition::Remote { url, transport, .. } => {
                format!("remote ({}): {url}", transport.as_str())
            }
        };
        println!("  {:<24} {}", entry.name, shape);
    }
    if !profile.gate_enabled {
        println!("  note: confirmation gate is disabled");
    }
    Ok(())
}
