use crate::config::{generate::generate_starter_config, load};
use std::fs;
use std::path::{Path, PathBuf};

const SYSTEM_CONFIG: &str = "/etc/docproc/config.yml";

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();

    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    let config_path = user_config_path().unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG));
    write_config(&config_content, &config_path)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}

/// `~/.config/docproc/config.yml`, if its directory can be created.
fn user_config_path() -> Option<PathBuf> {
    let user_config = dirs::home_dir()?.join(".config/docproc/config.yml");
    let parent = user_config.parent()?;

    match fs::create_dir_all(parent) {
        Ok(()) => Some(user_config),
        Err(_) => {
            eprintln!("Warning: Could not create directory {}", parent.display());
            eprintln!("Falling back to {}", SYSTEM_CONFIG);
            None
        }
    }
}

fn write_config(config_content: &str, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!(
            "Config file already exists at {}. Remove it first or use --stdout to print the config",
            path.display()
        )
        .into());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, config_content)?;
    Ok(())
}

/// Loads the effective configuration (file plus environment) and reports
/// which credentials are still missing.
pub fn validate(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(config_path)?;
    println!("Config is valid");

    let missing: Vec<&str> = [
        ("DOCUMENT_INTELLIGENCE_ENDPOINT", &config.extraction.endpoint),
        ("DOCUMENT_INTELLIGENCE_API_KEY", &config.extraction.api_key),
        ("OPENAI_ENDPOINT", &config.completion.endpoint),
        ("OPENAI_API_KEY", &config.completion.api_key),
        ("OPENAI_API_VERSION", &config.completion.api_version),
    ]
    .into_iter()
    .filter(|(_, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
    .map(|(name, _)| name)
    .collect();

    for name in &missing {
        println!("  not configured: {}", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_config_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.yml");

        write_config("web: {}\n", &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "web: {}\n");

        let err = write_config("other", &path).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "web: {}\n");
    }
}
