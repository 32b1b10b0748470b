use farmhand_core::{Config, Paths};

/// Show the current configuration as pretty-printed JSON.
pub async fn show() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    println!();
    println!("Current configuration");
    println!("  File: {}", paths.config_file().display());
    if !paths.config_file().exists() {
        println!("  (not found, showing defaults)");
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Write the default configuration.
pub async fn init(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let file = paths.config_file();
    if file.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", file.display());
    }

    Config::default().save(&file)?;
    println!("✓ Wrote default config: {}", file.display());
    Ok(())
}

pub async fn path() -> anyhow::Result<()> {
    println!("{}", Paths::new().config_file().display());
    Ok(())
}
