//! Writing the finished bundle and copying it into the runtime directory

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::info;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

/// A bundle written to the output directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the contents
    pub sha256: String,
    pub size: usize,
}

pub fn sha256_hex(contents: &[u8]) -> String {
    format!("{:x}", Sha256::digest(contents))
}

/// Write `contents` to `output_dir/name` atomically
///
/// The bundle goes to a temporary file in the same directory first and is
/// then renamed over the target, so readers never see a partial artifact.
pub fn write_artifact(output_dir: &Path, name: &str, contents: &str) -> Result<Artifact> {
    fs::create_dir_all(output_dir).with_context(|| {
        format!("Failed to create output directory {}", output_dir.display())
    })?;
    let path = output_dir.join(name);

    let mut temp = NamedTempFile::new_in(output_dir)
        .with_context(|| format!("Failed to create temporary file in {}", output_dir.display()))?;
    temp.write_all(contents.as_bytes())
        .and_then(|()| temp.flush())
        .with_context(|| format!("Failed to write bundle for {}", path.display()))?;
    temp.persist(&path)
        .with_context(|| format!("Failed to move bundle into place at {}", path.display()))?;

    info!("Bundle written to {}", path.display());
    Ok(Artifact {
        path,
        sha256: sha256_hex(contents.as_bytes()),
        size: contents.len(),
    })
}

/// Copy an artifact verbatim into the deploy directory
pub fn deploy_artifact(artifact: &Artifact, deploy_dir: &Path) -> Result<PathBuf> {
    let target = copy_into(&artifact.path, deploy_dir)?;
    info!("Deployed to {}", target.display());
    Ok(target)
}

/// Deploy a standalone Lua file as-is, without bundling
///
/// The returned artifact describes the deployed copy.
pub fn deploy_single_file(source: &Path, deploy_dir: &Path) -> Result<Artifact> {
    let contents =
        fs::read(source).with_context(|| format!("Failed to read {}", source.display()))?;
    let path = copy_into(source, deploy_dir)?;
    info!("Single file deployed to {}", path.display());
    Ok(Artifact {
        path,
        sha256: sha256_hex(&contents),
        size: contents.len(),
    })
}

fn copy_into(source: &Path, deploy_dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .with_context(|| format!("Path {} has no file name", source.display()))?;
    fs::create_dir_all(deploy_dir)
        .with_context(|| format!("Failed to create deploy directory {}", deploy_dir.display()))?;

    let target = deploy_dir.join(name);
    fs::copy(source, &target).with_context(|| {
        format!("Failed to deploy {} to {}", source.display(), target.display())
    })?;
    Ok(target)
}

/// Where a finished bundle goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub output_dir: PathBuf,
    pub output_name: String,
    /// `None` writes the artifact without deploying it
    pub deploy_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub artifact: Artifact,
    pub deployed: Option<PathBuf>,
}

/// Write the bundle, then deploy it if the target has a deploy directory
pub fn publish(bundle: &str, target: &PublishTarget) -> Result<Published> {
    let artifact = write_artifact(&target.output_dir, &target.output_name, bundle)?;
    let deployed = target
        .deploy_dir
        .as_deref()
        .map(|dir| deploy_artifact(&artifact, dir))
        .transpose()?;
    Ok(Published { artifact, deployed })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_write_replaces_previous_artifact() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let output = temp_dir.path().join("build");

        write_artifact(&output, "Main.lua", "return 1\n")?;
        let artifact = write_artifact(&output, "Main.lua", "return 2\n")?;

        assert_eq!(fs::read_to_string(&artifact.path)?, "return 2\n");
        assert_eq!(artifact.size, 9);
        assert_eq!(artifact.sha256, sha256_hex(b"return 2\n"));
        // No temporary files are left beside the artifact
        assert_eq!(fs::read_dir(&output)?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_deploy_copies_verbatim() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let artifact = write_artifact(&temp_dir.path().join("build"), "Tools.lua", "return {}\n")?;

        let deployed = deploy_artifact(&artifact, &temp_dir.path().join("runtime/lua"))?;
        assert_eq!(deployed, temp_dir.path().join("runtime/lua/Tools.lua"));
        assert_eq!(fs::read(&deployed)?, fs::read(&artifact.path)?);
        Ok(())
    }

    #[test]
    fn test_single_file_deploy_keeps_name_and_bytes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("project/Tool.lua");
        fs::create_dir_all(temp_dir.path().join("project"))?;
        fs::write(&source, "local x = require('ui')\nreturn x\n")?;

        let artifact = deploy_single_file(&source, &temp_dir.path().join("runtime/lua"))?;
        assert_eq!(artifact.path, temp_dir.path().join("runtime/lua/Tool.lua"));
        assert_eq!(fs::read(&artifact.path)?, fs::read(&source)?);
        assert_eq!(artifact.sha256, sha256_hex(&fs::read(&source)?));
        assert_eq!(artifact.size, 33);
        Ok(())
    }

    #[test]
    fn test_publish_without_deploy_dir() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let target = PublishTarget {
            output_dir: temp_dir.path().join("build"),
            output_name: "Main.lua".to_owned(),
            deploy_dir: None,
        };

        let published = publish("return 1\n", &target)?;
        assert_eq!(published.deployed, None);
        assert_eq!(published.artifact.path, temp_dir.path().join("build/Main.lua"));
        Ok(())
    }
}
