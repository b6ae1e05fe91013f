//! The line based `mprof` data format.
//!
//! ```text
//! CMDLINE python script.py
//! MEM 12.500000 1718000000.1234
//! ```

use std::io::{self, Write};

use hala_mprof::{Measurement, Usage};

pub fn write_cmdline<W: Write + ?Sized>(stream: &mut W, program: &[String]) -> io::Result<()> {
    writeln!(stream, "CMDLINE {}", program.join(" "))
}

pub fn write_measurement<W: Write + ?Sized>(stream: &mut W, measurement: &Measurement) -> io::Result<()> {
    writeln!(
        stream,
        "MEM {:.6} {:.4}",
        measurement.mib,
        measurement.epoch_secs().unwrap_or_default()
    )
}

pub fn write_usage<W: Write + ?Sized>(stream: &mut W, usage: &Usage) -> io::Result<()> {
    match usage {
        Usage::Series(series) => {
            for measurement in series {
                write_measurement(stream, measurement)?;
            }
        }
        Usage::Max(measurement) => write_measurement(stream, measurement)?,
        Usage::Streamed(_) => {}
    }

    Ok(())
}

/// Largest `MEM` reading of a data file, sentinel readings excluded.
pub fn peak(text: &str) -> Option<f64> {
    text.lines()
        .filter_map(|line| line.strip_prefix("MEM "))
        .filter_map(|fields| fields.split_whitespace().next()?.parse::<f64>().ok())
        .filter(|mib| *mib >= 0.0)
        .reduce(f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_of_readings() {
        let text = "CMDLINE sleep 1\nMEM 1.500000 1.0\nMEM 3.250000 2.0\nMEM -1.000000 3.0\nFUNC f 1 2 3 4 0\n";

        assert_eq!(peak(text), Some(3.25));
        assert_eq!(peak("CMDLINE sleep 1\n"), None);
    }

    #[test]
    fn usage_lines() {
        let mut out = Vec::new();

        write_cmdline(&mut out, &["sleep".into(), "1".into()]).unwrap();
        write_usage(&mut out, &Usage::Max(Measurement::new(2.0, false))).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "CMDLINE sleep 1\nMEM 2.000000 0.0000\n");
    }
}
