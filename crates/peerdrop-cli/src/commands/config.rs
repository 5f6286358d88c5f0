//! Config command implementation.

use anyhow::{Context, Result};

use peerdrop_core::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub async fn run(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Get { key } => {
            let config = super::load_config();
            match config.get_value(&key)? {
                Some(value) => println!("{}: {}", key, value),
                None => println!("Unknown configuration key: {}", key),
            }
        }

        ConfigAction::Set { key, value } => {
            let mut config = Config::load().context("Failed to load configuration")?;
            config
                .set_value(&key, &value)
                .with_context(|| format!("Cannot set {}", key))?;
            config.save().context("Failed to save configuration")?;
            println!("Set {} = {}", key, value);
        }

        ConfigAction::Show => {
            let config = super::load_config();
            println!();
            println!("PeerDrop Configuration");
            println!("{}", "─".repeat(50));
            for line in render(&config)? {
                println!("{}", line);
            }
            println!();
        }

        ConfigAction::List => {
            for key in Config::default().keys()? {
                println!("{}", key);
            }
        }

        ConfigAction::Path => {
            println!("{}", Config::config_path().display());
        }

        ConfigAction::Reset => {
            Config::default()
                .save()
                .context("Failed to save configuration")?;
            println!("Configuration reset to defaults.");
        }
    }

    Ok(())
}

/// Render the configuration as `[section]` blocks of `name = value` lines.
fn render(config: &Config) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut section = String::new();

    let mut keys: Vec<(String, String)> = config
        .keys()?
        .into_iter()
        .map(|key| {
            let (prefix, name) = key.rsplit_once('.').unwrap_or(("", key.as_str()));
            (prefix.to_string(), name.to_string())
        })
        .collect();
    keys.sort_by(|a, b| a.0.cmp(&b.0));

    for (prefix, name) in keys {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        if prefix != section {
            section.clone_from(&prefix);
            lines.push(String::new());
            lines.push(format!("[{}]", section));
        }
        let value = config.get_value(&key)?.unwrap_or_default();
        lines.push(format!("  {} = {}", name, value));
    }

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_groups_by_section() {
        let lines = render(&Config::default()).unwrap();

        let chunk = lines.iter().position(|l| l == "[chunk]").unwrap();
        let tier = lines
            .iter()
            .position(|l| l == "[monitor.excellent]")
            .unwrap();
        assert!(chunk < tier);
        assert!(lines.iter().any(|l| l.starts_with("  max_chunk_size = ")));
        for header in ["[chunk]", "[monitor]"] {
            assert_eq!(lines.iter().filter(|l| l.as_str() == header).count(), 1);
        }
    }
}
