use crate::machine::{Machine, DEFAULT_BACKEND, DEFAULT_CPUS, DEFAULT_MEMORY_MIB};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk machine description.
///
/// ```toml
/// [machine]
/// memory = 1024
/// cpus = 4
/// backend = "kvm"
/// initrd = "/var/tmp/fakemachine/initrd.gz"
///
/// [[image]]
/// path = "/var/tmp/root.img"
/// label = "root"
///
/// [[volume]]
/// host = "/srv/build"
/// guest = "/build"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MachineFile {
    #[serde(default)]
    pub machine: MachineSection,
    #[serde(default, rename = "image")]
    pub images: Vec<ImageEntry>,
    #[serde(default, rename = "volume")]
    pub volumes: Vec<VolumeEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MachineSection {
    #[serde(default = "default_memory")]
    pub memory: u64,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default)]
    pub show_boot: bool,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub initrd: Option<PathBuf>,
}

impl Default for MachineSection {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
            show_boot: false,
            backend: default_backend(),
            initrd: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImageEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VolumeEntry {
    pub host: PathBuf,
    #[serde(default)]
    pub guest: Option<PathBuf>,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_memory() -> u64 {
    DEFAULT_MEMORY_MIB
}

fn default_cpus() -> u32 {
    DEFAULT_CPUS
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_owned()
}

impl MachineFile {
    /// Build a `Machine` through the same operations a library caller would
    /// use, so image indices and generated labels are identical.
    pub fn into_machine(self) -> Machine {
        let mut machine = Machine::with_backend(self.machine.backend.trim().to_lowercase());
        machine
            .set_memory(self.machine.memory)
            .set_cpus(self.machine.cpus)
            .set_show_boot(self.machine.show_boot);
        if let Some(initrd) = self.machine.initrd {
            machine.set_initrd(initrd);
        }
        for image in self.images {
            machine.add_image(image.path, image.label.as_deref());
        }
        for volume in self.volumes {
            let guest = volume.guest.unwrap_or_else(|| volume.host.clone());
            match volume.label {
                Some(label) => machine.add_labelled_volume(volume.host, guest, label),
                None => machine.add_volume_at(volume.host, guest),
            }
        }
        machine
    }
}

pub fn parse_machine_str(input: &str) -> Result<MachineFile, SchemaError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_machine_file(path: impl AsRef<Path>) -> Result<MachineFile, SchemaError> {
    let content = fs::read_to_string(path)?;
    parse_machine_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_machine_file() {
        let input = r#"
[machine]
memory = 512
cpus = 4
show_boot = true
backend = "UML"
initrd = "/tmp/initrd.gz"

[[image]]
path = "/tmp/a.img"
label = "root"

[[image]]
path = "/tmp/b.img"

[[volume]]
host = "/srv/src"
guest = "/src"
label = "source"

[[volume]]
host = "/srv/out"
"#;
        let machine = parse_machine_str(input).expect("should parse").into_machine();
        assert_eq!(machine.memory(), 512);
        assert_eq!(machine.cpus(), 4);
        assert!(machine.show_boot());
        assert_eq!(machine.backend(), "uml");
        assert_eq!(machine.initrd_path(), Path::new("/tmp/initrd.gz"));

        assert_eq!(machine.images()[0].label, "root");
        assert_eq!(machine.images()[1].label, "fakedisk-1");
        assert_eq!(machine.images()[1].index, 1);

        assert_eq!(machine.mounts()[0].label, "source");
        assert_eq!(machine.mounts()[0].machine_directory, PathBuf::from("/src"));
        assert_eq!(machine.mounts()[1].label, "virtfs-1");
        assert_eq!(machine.mounts()[1].machine_directory, PathBuf::from("/srv/out"));
        assert!(machine.validate().is_ok());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let machine = parse_machine_str("").expect("should parse").into_machine();
        assert_eq!(machine.memory(), DEFAULT_MEMORY_MIB);
        assert_eq!(machine.cpus(), DEFAULT_CPUS);
        assert_eq!(machine.backend(), "auto");
        assert!(machine.images().is_empty());
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = r"
[machine]
memory = 512
swap = 1024
";
        assert!(matches!(
            parse_machine_str(input),
            Err(SchemaError::ParseToml(_))
        ));
    }

    #[test]
    fn rejects_image_without_path() {
        let input = r#"
[[image]]
label = "root"
"#;
        assert!(parse_machine_str(input).is_err());
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.toml");
        fs::write(&path, "[machine]\ncpus = 8\n").unwrap();
        let file = parse_machine_file(&path).unwrap();
        assert_eq!(file.machine.cpus, 8);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            parse_machine_file(dir.path().join("absent.toml")),
            Err(SchemaError::Io(_))
        ));
    }
}
