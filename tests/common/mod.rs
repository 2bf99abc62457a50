#![allow(dead_code)]

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

pub const WORD_COUNT_YAML: &str = "\
sources:
  - id: randomsentence
    script: randomsentence.py
    parallelism: 1
    fields: [sentence]
transforms:
  - id: splitsentence
    script: splitsentence.py
    parallelism: 1
    fields: [word]
    inputs:
      - source: randomsentence
        grouping: shuffle
  - id: wordcount
    script: wordcount.py
    parallelism: 1
    fields: [word, count]
    inputs:
      - source: splitsentence
        grouping: fields
        fields: [word]
";

/// Minimal stand-in for the engine's launcher archive
pub fn write_base_archive(path: &Path) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    zip.start_file("META-INF/MANIFEST.MF", SimpleFileOptions::default())
        .unwrap();
    zip.write_all(b"Manifest-Version: 1.0\nMain-Class: squall.Launcher\n")
        .unwrap();
    zip.finish().unwrap();
}

/// Word count topology directory with scripts and a manifest
pub fn word_count_dir(root: &Path, manifest: &str) -> PathBuf {
    let dir = root.join("wordcount");
    fs::create_dir_all(&dir).unwrap();
    for script in ["randomsentence.py", "splitsentence.py", "wordcount.py"] {
        fs::write(dir.join(script), format!("# {}\n", script)).unwrap();
    }
    fs::write(dir.join("topology.yaml"), WORD_COUNT_YAML).unwrap();
    fs::write(dir.join("manifest.txt"), manifest).unwrap();
    dir
}

pub fn read_entry(archive: &Path, name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(File::open(archive).unwrap()).unwrap();
    let mut data = Vec::new();
    archive.by_name(name).unwrap().read_to_end(&mut data).unwrap();
    data
}

pub fn entry_names(archive: &Path) -> Vec<String> {
    let archive = ZipArchive::new(File::open(archive).unwrap()).unwrap();
    archive.file_names().map(str::to_string).collect()
}
