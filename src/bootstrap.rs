use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::DEFAULT_HOST_PATH_PREFIX;
use crate::error::Error;
use crate::podspec::BOOTSTRAP_MOUNT_PATH;

/// Populates the shared zoneinfo volume from the TZif files baked into the image.
#[derive(Debug, Clone)]
pub struct BootstrapOperation {
    pub from: PathBuf,
    pub to: PathBuf,
    pub overwrite: bool,
}

impl Default for BootstrapOperation {
    fn default() -> Self {
        Self {
            from: PathBuf::from(DEFAULT_HOST_PATH_PREFIX),
            to: PathBuf::from(BOOTSTRAP_MOUNT_PATH),
            overwrite: true,
        }
    }
}

impl BootstrapOperation {
    pub fn run(&self) -> Result<(), Error> {
        info!(from = %self.from.display(), to = %self.to.display(), "bootstrapping zoneinfo");
        copy_directory(&self.from, &self.to, self.overwrite)
    }
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Error {
    let path = path.display().to_string();
    move |source| Error::Bootstrap {
        action,
        path,
        source,
    }
}

fn exists(path: &Path) -> Result<bool, Error> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err("check existence of", path)(e)),
    }
}

/// Recursively copies `src` into the existing directory `dst`. Directories are
/// created as needed, symlinks are recreated with their original target and
/// existing files are replaced only when `overwrite` is set.
pub fn copy_directory(src: &Path, dst: &Path, overwrite: bool) -> Result<(), Error> {
    for entry in fs::read_dir(src).map_err(io_err("read directory", src))? {
        let entry = entry.map_err(io_err("read directory", src))?;
        let source_path = entry.path();
        let dest_path = dst.join(entry.file_name());

        let metadata = fs::symlink_metadata(&source_path).map_err(io_err("stat", &source_path))?;
        let file_type = metadata.file_type();

        if file_type.is_dir() {
            create_if_not_exists(&dest_path)?;
            copy_directory(&source_path, &dest_path, overwrite)?;
        } else if file_type.is_symlink() {
            copy_symlink(&source_path, &dest_path, overwrite)?;
            continue;
        } else if !exists(&dest_path)? || overwrite {
            debug!(from = %source_path.display(), to = %dest_path.display(), "copying file");
            fs::copy(&source_path, &dest_path).map_err(io_err("copy file to", &dest_path))?;
        } else {
            debug!(path = %dest_path.display(), "skipping file because it already exists");
        }

        fs::set_permissions(&dest_path, metadata.permissions())
            .map_err(io_err("set permissions on", &dest_path))?;
    }

    Ok(())
}

fn create_if_not_exists(dir: &Path) -> Result<(), Error> {
    if exists(dir)? {
        debug!(path = %dir.display(), "directory already exists");
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(io_err("create directory", dir))?;
    debug!(path = %dir.display(), "directory created");
    Ok(())
}

fn copy_symlink(source: &Path, dest: &Path, overwrite: bool) -> Result<(), Error> {
    if exists(dest)? {
        if !overwrite {
            debug!(path = %dest.display(), "skipping symlink because it already exists");
            return Ok(());
        }
        fs::remove_file(dest).map_err(io_err("remove symlink", dest))?;
    }

    let target = fs::read_link(source).map_err(io_err("read link", source))?;
    symlink(&target, dest).map_err(io_err("create symlink", dest))?;
    debug!(path = %dest.display(), target = %target.display(), "symlink created");
    Ok(())
}
