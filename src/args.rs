use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use fieldcorr::store::{FieldRef, HaloPolicy};

pub const DEFAULT_OUTPUT: &str = "correlation_lags.txt";

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Transform each field in one piece
    Full,
    /// Stream the field window by window
    Patched,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Halo {
    /// Surround the stored field with `cutoff` zeros
    Zero,
    /// The stored field already carries its halo
    Embedded,
}

impl From<Halo> for HaloPolicy {
    fn from(halo: Halo) -> Self {
        match halo {
            Halo::Zero => HaloPolicy::ZeroPad,
            Halo::Embedded => HaloPolicy::Embedded,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Two-point correlation counts of 2D/3D fields",
    long_about = None,
    arg_required_else_help = true,
    after_help = "Examples:\n  fieldcorr --field1 run1.fld/Porosity --cutoff 4\n  fieldcorr --field1 run1.fld/H1 --field2 run1.fld/H2 --cutoff 2 --winmulti 4\n  fieldcorr --field1 small.fld --mode full --output small_lags.txt\n"
)]
pub struct Args {
    /// Field reference `<container>.fld/<array>` (array defaults to H1)
    #[arg(long, visible_alias = "f1", value_parser = parse_field_ref)]
    pub field1: FieldRef,

    /// Second field; cross-correlates against --field1 when given
    #[arg(long, visible_alias = "f2", value_parser = parse_field_ref)]
    pub field2: Option<FieldRef>,

    /// Largest lag per axis
    #[arg(long, default_value_t = 1)]
    pub cutoff: usize,

    /// Window extent multiplier; windows span winmulti * (cutoff + 1) core cells
    #[arg(long, default_value_t = 2)]
    pub winmulti: usize,

    #[arg(long, value_enum, default_value_t = Mode::Patched)]
    pub mode: Mode,

    #[arg(long, value_enum, default_value_t = Halo::Zero)]
    pub halo: Halo,

    /// Lag table destination
    #[arg(long, short, default_value = DEFAULT_OUTPUT)]
    pub output: PathBuf,

    /// Log every window
    #[arg(long)]
    pub debug: bool,
}

fn parse_field_ref(value: &str) -> Result<FieldRef, String> {
    FieldRef::parse(value).map_err(|e| e.to_string())
}
