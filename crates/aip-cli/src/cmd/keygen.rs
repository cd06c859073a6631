use aip_api::identity::write_keypair;
use aip_types::config::AipConfig;
use aip_types::identity::AgentKeypair;
use std::path::PathBuf;

pub fn run(config: &AipConfig, out: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = out
        .or_else(|| config.identity.key_file.clone())
        .unwrap_or_else(|| aip_kernel::config::aip_home().join("agent.key"));
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let keypair = AgentKeypair::generate();
    write_keypair(&path, &keypair)?;
    println!("Key written to {}", path.display());
    println!("Public key: {}", keypair.public_key_hex());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.key");
        let config = AipConfig::default();

        run(&config, Some(path.clone()), false).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(run(&config, Some(path.clone()), false).is_err());

        run(&config, Some(path.clone()), true).unwrap();
        assert_ne!(std::fs::read_to_string(&path).unwrap(), first);
    }
}
