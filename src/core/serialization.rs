use std::fs::File;
use std::path::Path;

use log::{debug, info};
use ndarray::prelude::*;

use ndarray_npy::{NpzReader, NpzWriter};

use super::{Blob, Workspace, WorkspaceError};

pub fn archive_filename(identifier: &str, specifier: &str) -> String {
    format!("{}-{}.npz", identifier, specifier)
}

pub fn serialize(workspace: &Workspace, path: &Path) -> Result<(), WorkspaceError> {
    info!("serializing {} blobs to {} ...", workspace.len(), path.display());
    let mut npz_writer = NpzWriter::new(File::create(path)?);
    for name in workspace.names() {
        match workspace.get(&name)? {
            Blob::Float(array) => npz_writer.add_array(name.as_str(), array)?,
            Blob::Integer(array) => npz_writer.add_array(name.as_str(), array)?,
        }
    }
    npz_writer.finish()?;
    Ok(())
}

pub fn deserialize(path: &Path) -> Result<Workspace, WorkspaceError> {
    let mut npz_reader = NpzReader::new(File::open(path)?)?;
    let mut workspace = Workspace::new();
    for entry in npz_reader.names()? {
        let name = entry.strip_suffix(".npy").unwrap_or(&entry).to_owned();
        // Archives don't say up front what they hold; anything that isn't
        // float data is read as integers.
        let floats: Result<ArrayD<f32>, _> = npz_reader.by_name(&entry);
        let blob = match floats {
            Ok(array) => Blob::Float(array),
            Err(_) => Blob::Integer(npz_reader.by_name(&entry)?),
        };
        debug!("loaded {:?} with shape {:?}", name, blob.shape());
        workspace.set(&name, blob);
    }
    Ok(workspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    #[test]
    fn test_archive_filename() {
        assert_eq!(archive_filename("lambdarank", "seed7"), "lambdarank-seed7.npz");
    }

    #[test]
    fn test_workspace_survives_archive() {
        let mut workspace = Workspace::new();
        workspace.set("y", array![0.5f32, -0.3, 0.25]);
        workspace.set("session_lengths", array![1i32, 2]);
        workspace.set("grid", array![[1.0f32, 2.0], [3.0, 4.0]]);

        let path = env::temp_dir().join(format!(
            "lambdarank-serialization-test-{}.npz",
            std::process::id()
        ));
        serialize(&workspace, &path).unwrap();
        let restored = deserialize(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(restored.names(), workspace.names());
        for name in workspace.names() {
            assert_eq!(restored.get(&name).unwrap(), workspace.get(&name).unwrap());
        }
    }

    #[test]
    fn test_missing_archive() {
        let path = env::temp_dir().join("lambdarank-no-such-archive.npz");
        assert!(matches!(deserialize(&path), Err(WorkspaceError::Io(_))));
    }
}
