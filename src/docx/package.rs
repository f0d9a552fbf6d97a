use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

use anyhow::Context;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::xml::{parse_xml_part, XmlPart};

pub struct DocxPackage {
    pub entries: Vec<DocxEntry>,
}

pub struct DocxEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub compression: CompressionMethod,
    pub last_modified: zip::DateTime,
    pub unix_mode: Option<u32>,
    pub is_dir: bool,
}

/// Pending edits to a package: new or replaced part bytes plus parts to drop.
#[derive(Debug, Default)]
pub struct PartChanges {
    pub replace: BTreeMap<String, Vec<u8>>,
    pub remove: BTreeSet<String>,
}

impl PartChanges {
    pub fn put(&mut self, name: &str, data: Vec<u8>) {
        self.remove.remove(name);
        self.replace.insert(name.to_string(), data);
    }

    pub fn drop_part(&mut self, name: &str) {
        self.replace.remove(name);
        self.remove.insert(name.to_string());
    }
}

impl DocxPackage {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let f = File::open(path).with_context(|| format!("open docx: {}", path.display()))?;
        Self::from_reader(f).with_context(|| format!("read docx: {}", path.display()))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> anyhow::Result<Self> {
        Self::from_reader(Cursor::new(bytes))
    }

    fn from_reader<R: Read + Seek>(reader: R) -> anyhow::Result<Self> {
        let mut zip = ZipArchive::new(reader).context("read zip")?;
        let mut entries = Vec::new();
        for i in 0..zip.len() {
            let mut file = zip.by_index(i).context("zip entry")?;
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data).context("read zip entry")?;
            entries.push(DocxEntry {
                name: file.name().to_string(),
                data,
                compression: file.compression(),
                last_modified: file.last_modified().unwrap_or_default(),
                unix_mode: file.unix_mode(),
                is_dir: file.is_dir(),
            });
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.name == name && !e.is_dir)
            .map(|e| e.data.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Parsed XML for `name`, or `None` when the package lacks the part.
    pub fn xml_part(&self, name: &str) -> anyhow::Result<Option<XmlPart>> {
        match self.get(name) {
            Some(bytes) => parse_xml_part(name, bytes)
                .with_context(|| format!("parse part {name}"))
                .map(Some),
            None => Ok(None),
        }
    }

    /// Story parts that may carry comment anchors, document body first.
    pub fn story_part_names(&self) -> Vec<String> {
        let mut extra: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.name.as_str())
            .filter(|name| {
                let Some(file) = name.strip_prefix("word/") else {
                    return false;
                };
                !file.contains('/')
                    && file.ends_with(".xml")
                    && (file == "footnotes.xml"
                        || file == "endnotes.xml"
                        || file.starts_with("header")
                        || file.starts_with("footer"))
            })
            .map(str::to_string)
            .collect();
        extra.sort();
        let mut names = Vec::with_capacity(extra.len() + 1);
        if self.contains("word/document.xml") {
            names.push("word/document.xml".to_string());
        }
        names.extend(extra);
        names
    }

    /// Serialize the package with `changes` applied. New parts go after existing ones.
    pub fn to_bytes(&self, changes: &PartChanges) -> anyhow::Result<Vec<u8>> {
        let mut zout = ZipWriter::new(Cursor::new(Vec::new()));
        for ent in &self.entries {
            if changes.remove.contains(&ent.name) {
                continue;
            }
            let data = changes.replace.get(&ent.name).unwrap_or(&ent.data);
            let mut opts = SimpleFileOptions::default()
                .compression_method(ent.compression)
                .last_modified_time(ent.last_modified);
            if let Some(mode) = ent.unix_mode {
                opts = opts.unix_permissions(mode);
            }
            if ent.is_dir || ent.name.ends_with('/') {
                zout.add_directory(ent.name.as_str(), opts)
                    .with_context(|| format!("add zip dir: {}", ent.name))?;
            } else {
                zout.start_file(ent.name.as_str(), opts)
                    .with_context(|| format!("start zip file: {}", ent.name))?;
                zout.write_all(data)
                    .with_context(|| format!("write zip file: {}", ent.name))?;
            }
        }
        for (name, data) in &changes.replace {
            if self.entries.iter().any(|e| &e.name == name) {
                continue;
            }
            let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            zout.start_file(name.as_str(), opts)
                .with_context(|| format!("start zip file: {name}"))?;
            zout.write_all(data)
                .with_context(|| format!("write zip file: {name}"))?;
        }
        let cursor = zout.finish().context("finish zip")?;
        Ok(cursor.into_inner())
    }

    pub fn write_with_changes(&self, output_path: &Path, changes: &PartChanges) -> anyhow::Result<()> {
        let bytes = self.to_bytes(changes)?;
        let mut f = File::create(output_path)
            .with_context(|| format!("create output docx: {}", output_path.display()))?;
        f.write_all(&bytes)
            .with_context(|| format!("write output docx: {}", output_path.display()))?;
        Ok(())
    }
}
