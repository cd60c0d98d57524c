//! `deepsearch init`: first-time setup.

use deepsearch_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("deepsearch setup");
    println!("================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("  Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    if config_path.exists() {
        println!("\n  Config already exists at: {}", config_path.display());
        println!("  Edit it manually or delete it and re-run init.\n");
        return Ok(());
    }

    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("  Created config.toml at: {}", config_path.display());
    println!("\nNext steps:");
    println!("   1. Set OPENROUTER_API_KEY (or api_key in the config)");
    println!("   2. Set SERPER_API_KEY for web search");
    println!("   3. Run: deepsearch ask \"What happened in Rust this week?\"\n");

    Ok(())
}
