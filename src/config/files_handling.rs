use crate::data::{Id, SplitIds};
use crate::error::RecError;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use ndarray_npy::{read_npy, write_npy};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

// `file_path` is given without extension, every type appends its own
fn with_extension(file_path: &Path, extension: &str) -> PathBuf {
    let mut path = file_path.as_os_str().to_owned();
    path.push(extension);
    PathBuf::from(path)
}

fn open(path: &Path) -> Result<File, RecError> {
    File::open(path).map_err(|source| RecError::File { path: path.to_owned(), source })
}

fn create(path: &Path) -> Result<File, RecError> {
    File::create(path).map_err(|source| RecError::File { path: path.to_owned(), source })
}

pub fn read_input<R: ReadFile>(file_path: &Path) -> Result<R, RecError> {
    R::read_file(file_path)
}

pub fn save_output<S: SaveFile>(output_dir: &Path, file_name: &str, item: &S) -> Result<(), RecError> {

    // create output folder
    fs::create_dir_all(output_dir)
        .map_err(|source| RecError::File { path: output_dir.to_owned(), source })?;

    item.save_file(output_dir, file_name)
}

pub fn exists<R: ReadFile>(file_path: &Path) -> bool {
    with_extension(file_path, R::EXTENSION).is_file()
}

pub trait ReadFile: Sized {
    const EXTENSION: &'static str;
    fn read_file(file_path: &Path) -> Result<Self, RecError>;
}

pub trait SaveFile {
    fn save_file(&self, output_dir: &Path, file_name: &str) -> Result<(), RecError>;
}

// embedding matrices, one row per question
impl ReadFile for Array2<f32> {
    const EXTENSION: &'static str = ".npy";
    fn read_file(file_path: &Path) -> Result<Self, RecError> {
        let item = read_npy(with_extension(file_path, Self::EXTENSION))?;
        Ok(item)
    }
}

impl SaveFile for Array2<f32> {
    fn save_file(&self, output_dir: &Path, file_name: &str) -> Result<(), RecError> {
        let out = with_extension(&output_dir.join(file_name), <Self as ReadFile>::EXTENSION);
        write_npy(out, self)?;
        Ok(())
    }
}

// question ids matching the rows of an embedding matrix
impl ReadFile for Vec<Id> {
    const EXTENSION: &'static str = ".json";
    fn read_file(file_path: &Path) -> Result<Self, RecError> {
        let f = BufReader::new(open(&with_extension(file_path, Self::EXTENSION))?);
        let item = serde_json::from_reader(f)?;
        Ok(item)
    }
}

impl SaveFile for Vec<Id> {
    fn save_file(&self, output_dir: &Path, file_name: &str) -> Result<(), RecError> {
        let out = with_extension(&output_dir.join(file_name), <Self as ReadFile>::EXTENSION);
        let f = BufWriter::new(create(&out)?);
        serde_json::to_writer(f, self)?;
        Ok(())
    }
}

impl ReadFile for SplitIds {
    const EXTENSION: &'static str = ".bin.gz";
    fn read_file(file_path: &Path) -> Result<Self, RecError> {
        let f = BufReader::new(open(&with_extension(file_path, Self::EXTENSION))?);
        let reader = GzDecoder::new(f);
        let item = bincode::deserialize_from(reader)?;
        Ok(item)
    }
}

impl SaveFile for SplitIds {
    fn save_file(&self, output_dir: &Path, file_name: &str) -> Result<(), RecError> {
        let out = with_extension(&output_dir.join(file_name), <Self as ReadFile>::EXTENSION);
        let f = BufWriter::new(create(&out)?);
        let mut writer = GzEncoder::new(f, Compression::default());
        bincode::serialize_into(&mut writer, self)?;
        writer.finish()?.flush()?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use ndarray::array;

    #[test]
    fn embeddings_and_ids_are_saved_side_by_side() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("embeddings");

        let w: Array2<f32> = array![[0.5, -1.0, 2.0], [3.0, 0.0, 0.25]];
        let ids = vec![Id::from(4), Id::new("q-7")];
        save_output(&out, "train", &w).unwrap();
        save_output(&out, "train_ids", &ids).unwrap();

        assert!(out.join("train.npy").is_file());
        assert!(out.join("train_ids.json").is_file());
        assert!(exists::<Array2<f32>>(&out.join("train")));
        assert!(!exists::<Array2<f32>>(&out.join("test")));

        assert_eq!(read_input::<Array2<f32>>(&out.join("train")).unwrap(), w);
        assert_eq!(read_input::<Vec<Id>>(&out.join("train_ids")).unwrap(), ids);
    }

    #[test]
    fn split_ids_are_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let split = SplitIds {
            train: (0..100).map(Id::from).collect(),
            val: vec![Id::new("a")],
            test: vec![Id::from(1000), Id::from(1001)],
        };
        save_output(dir.path(), "split", &split).unwrap();
        assert!(dir.path().join("split.bin.gz").is_file());
        assert_eq!(read_input::<SplitIds>(&dir.path().join("split")).unwrap(), split);
    }

    #[test]
    fn missing_files_name_the_path() {
        let dir = tempfile::tempdir().unwrap();
        match read_input::<Vec<Id>>(&dir.path().join("nothing")) {
            Err(RecError::File { path, .. }) => assert!(path.ends_with("nothing.json")),
            other => panic!("expected a file error, got {:?}", other),
        }
    }
}
