//! `nutriscan sources`: list the known sources of the active locator set.

use anyhow::Result;

use crate::config::RuntimeConfig;

use super::load_engine;

pub fn run(config: RuntimeConfig) -> Result<()> {
    let engine = load_engine(&config)?;
    let locators = engine.config();
    for source in &locators.sources {
        println!("{}", source.name);
        println!("    domains:    {}", source.domains.join(", "));
        println!("    containers: {}", source.containers.join(", "));
        println!("    locators:   {}", source.rules.len());
        if source.table.is_some() {
            println!("    table:      yes");
        }
    }
    println!("generic fallback locators: {}", locators.fallback.len());
    Ok(())
}
