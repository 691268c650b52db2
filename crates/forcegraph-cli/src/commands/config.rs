//! Config command implementation.

use anyhow::Result;

use crate::config::Config;

/// Show current configuration.
pub fn show(config: &Config) -> Result<()> {
    let physics = &config.simulation.physics;
    let device = &config.simulation.device;

    println!("fgsim Configuration");
    println!("{:-<40}", "");
    println!("Backend:           {}", config.backend);
    println!("Ticks:             {}", config.ticks);
    println!("Scaling Ratio:     {}", physics.scaling_ratio);
    println!("Gravity:           {}", physics.gravity);
    println!("Edge Influence:    {}", physics.edge_influence);
    println!("Jitter Tolerance:  {}", physics.jitter_tolerance);
    println!("Tau:               {}", physics.tau);
    println!("Prevent Overlap:   {}", physics.prevent_overlap);
    println!("Strong Gravity:    {}", physics.strong_gravity);
    println!("Dissuade Hubs:     {}", physics.dissuade_hubs);
    println!("LinLog:            {}", physics.lin_log);
    println!("Lock Points:       {}", config.simulation.locks.lock_points);
    println!("Block Count:       {}", device.block_count);
    println!(
        "Warp Size:         {}",
        device
            .warp_size
            .map(|w| w.to_string())
            .unwrap_or_else(|| "(from device)".to_string())
    );

    if let Some(config_path) = Config::config_file_path() {
        println!("\nConfig file: {}", config_path.display());
    }

    Ok(())
}

/// Set a configuration value.
pub fn set(config: &mut Config, key: &str, value: &str) -> Result<()> {
    config.apply(key, value)?;
    config.simulation.physics.validate()?;
    config.save()?;
    println!("Set {} to: {}", key, value);
    Ok(())
}

/// Get a configuration value.
pub fn get(config: &Config, key: &str) -> Result<()> {
    println!("{}", config.value(key)?);
    Ok(())
}

/// Reset configuration to defaults.
pub fn reset() -> Result<()> {
    let config = Config::default();
    config.save()?;
    println!("Configuration reset to defaults");
    Ok(())
}

/// Show path to config file.
pub fn path() -> Result<()> {
    match Config::config_file_path() {
        Some(path) => println!("{}", path.display()),
        None => anyhow::bail!("No config directory available on this platform"),
    }
    Ok(())
}
