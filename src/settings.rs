//! Shared settings.
//!
//! Settings are configured with a [`Builder`] and then frozen into an
//! immutable [`Flags`] value:
//!
//! ```ignore
//! let mut b = settings::builder();
//! b.set("code_alignment", "32")?;
//! b.enable("unique_pc")?;
//! let flags = settings::Flags::new(b);
//! ```

use core::fmt;
use core::str::FromStr;
use thiserror::Error;

/// An error produced when changing a setting.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SetError {
    /// No setting by this name exists.
    #[error("No existing setting named '{0}'")]
    BadName(String),

    /// Type mismatch for setting (e.g., setting enum with integer).
    #[error("Trying to set a setting with the wrong type")]
    BadType,

    /// This is not a valid value for this setting.
    #[error("Unexpected value for a setting, expected {0}")]
    BadValue(String),
}

/// A result returned when changing a setting.
pub type SetResult<T> = Result<T, SetError>;

/// The kind of a setting, for error reporting and `Display`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingKind {
    /// `true` / `false`.
    Bool,
    /// An unsigned 32-bit number.
    Num,
}

/// Description of one setting.
#[derive(Clone, Copy, Debug)]
pub struct Setting {
    /// Name of the setting.
    pub name: &'static str,
    /// What it controls.
    pub description: &'static str,
    /// Bool or numeric.
    pub kind: SettingKind,
}

/// Every setting the builder understands.
pub static SETTINGS: &[Setting] = &[
    Setting {
        name: "initial_capacity",
        description: "Number of code bytes reserved when a buffer is created.",
        kind: SettingKind::Num,
    },
    Setting {
        name: "code_alignment",
        description: "Alignment of the code size produced by `Assembler::finish`; 0 for none.",
        kind: SettingKind::Num,
    },
    Setting {
        name: "unique_pc",
        description: "Separate distinct program points that would share an address with a no-op.",
        kind: SettingKind::Bool,
    },
    Setting {
        name: "trim_output",
        description: "Return exactly the emitted bytes from `Assembler::finish`.",
        kind: SettingKind::Bool,
    },
];

/// Collect settings values before freezing them into [`Flags`].
#[derive(Clone, Debug)]
pub struct Builder {
    flags: Flags,
}

/// Create a new builder with every setting at its default.
pub fn builder() -> Builder {
    Builder {
        flags: Flags::default(),
    }
}

fn parse_bool(value: &str) -> SetResult<bool> {
    match value {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(SetError::BadValue("bool".to_string())),
    }
}

fn parse_num(value: &str) -> SetResult<u32> {
    u32::from_str(value).map_err(|_| SetError::BadValue("number".to_string()))
}

fn lookup(name: &str) -> SetResult<&'static Setting> {
    SETTINGS
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| SetError::BadName(name.to_string()))
}

impl Builder {
    /// Set the setting `name` to `value`, parsed according to its kind.
    pub fn set(&mut self, name: &str, value: &str) -> SetResult<()> {
        let setting = lookup(name)?;
        match setting.name {
            "initial_capacity" => self.flags.initial_capacity = parse_num(value)?,
            "code_alignment" => {
                let align = parse_num(value)?;
                if align != 0 && !align.is_power_of_two() {
                    return Err(SetError::BadValue("a power of two or 0".to_string()));
                }
                self.flags.code_alignment = align;
            }
            "unique_pc" => self.flags.unique_pc = parse_bool(value)?,
            "trim_output" => self.flags.trim_output = parse_bool(value)?,
            _ => unreachable!("setting {name} has no handler"),
        }
        Ok(())
    }

    /// Set the boolean setting `name` to true.
    pub fn enable(&mut self, name: &str) -> SetResult<()> {
        match lookup(name)?.kind {
            SettingKind::Bool => self.set(name, "true"),
            SettingKind::Num => Err(SetError::BadType),
        }
    }
}

/// Frozen settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flags {
    initial_capacity: u32,
    code_alignment: u32,
    unique_pc: bool,
    trim_output: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            initial_capacity: 1024,
            code_alignment: 16,
            unique_pc: true,
            trim_output: true,
        }
    }
}

impl Flags {
    /// Freeze the values collected in `builder`.
    pub fn new(builder: Builder) -> Self {
        builder.flags
    }

    /// Number of code bytes reserved when a buffer is created.
    pub fn initial_capacity(&self) -> u32 {
        self.initial_capacity
    }

    /// Alignment of the code produced by `Assembler::finish`.
    pub fn code_alignment(&self) -> u32 {
        self.code_alignment
    }

    /// Whether `ensure_unique_pc` emits separation no-ops.
    pub fn unique_pc(&self) -> bool {
        self.unique_pc
    }

    /// Whether `Assembler::finish` trims its output.
    pub fn trim_output(&self) -> bool {
        self.trim_output
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[shared]")?;
        writeln!(f, "initial_capacity = {}", self.initial_capacity)?;
        writeln!(f, "code_alignment = {}", self.code_alignment)?;
        writeln!(f, "unique_pc = {}", self.unique_pc)?;
        writeln!(f, "trim_output = {}", self.trim_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_default() {
        let f = Flags::new(builder());
        assert_eq!(
            f.to_string(),
            r#"[shared]
initial_capacity = 1024
code_alignment = 16
unique_pc = true
trim_output = true
"#
        );
    }

    #[test]
    fn modify_bool_and_num() {
        let mut b = builder();
        assert_eq!(b.set("unique_pc", "false"), Ok(()));
        assert_eq!(b.set("code_alignment", "64"), Ok(()));
        assert_eq!(b.set("initial_capacity", "4096"), Ok(()));
        let f = Flags::new(b);
        assert!(!f.unique_pc());
        assert_eq!(f.code_alignment(), 64);
        assert_eq!(f.initial_capacity(), 4096);
    }

    #[test]
    fn set_errors() {
        let mut b = builder();
        assert_eq!(b.enable("not_there"), Err(SetError::BadName("not_there".to_string())));
        assert_eq!(b.enable("code_alignment"), Err(SetError::BadType));
        assert_eq!(
            b.set("code_alignment", "12"),
            Err(SetError::BadValue("a power of two or 0".to_string()))
        );
        assert_eq!(b.set("trim_output", "maybe"), Err(SetError::BadValue("bool".to_string())));
        assert_eq!(b.set("initial_capacity", "-1"), Err(SetError::BadValue("number".to_string())));
    }
}
