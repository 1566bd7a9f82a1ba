//! `cortex init` — write a starter config.

use cortex_config::AppConfig;
use std::path::PathBuf;

pub async fn run(path: Option<PathBuf>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = path.unwrap_or_else(AppConfig::config_path);

    println!("Cortex — Setup");
    println!("==============\n");

    if config_path.exists() && !force {
        println!("⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or re-run with --force.\n");
        return Ok(());
    }

    if let Some(dir) = config_path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)?;
        println!("✅ Created config directory: {}", dir.display());
    }

    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("✅ Wrote config.toml at: {}", config_path.display());
    println!("\n📝 Next steps:");
    println!("   1. Add your tool servers under [[servers]]");
    println!("   2. Set CORTEX_API_KEY, or use planner.kind = \"command\" to run without a model");
    println!("   3. Check everything with `cortex status`\n");

    Ok(())
}
