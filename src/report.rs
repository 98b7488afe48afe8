use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use ndarray::{ArrayD, Dimension};

pub fn format_lag_table<W: Write>(writer: &mut W, counts: &ArrayD<f64>, cutoff: usize) -> io::Result<()> {
    let header: Vec<String> = (0..counts.ndim()).map(|axis| format!("lag_{axis}")).collect();
    writeln!(writer, "# {} value", header.join(" "))?;
    for (idx, value) in counts.indexed_iter() {
        for &i in idx.slice() {
            write!(writer, "{} ", i as i64 - cutoff as i64)?;
        }
        writeln!(writer, "{value:.6e}")?;
    }
    Ok(())
}

pub fn write_lag_table(path: &Path, counts: &ArrayD<f64>, cutoff: usize) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    format_lag_table(&mut writer, counts, cutoff)?;
    writer.flush()
}
