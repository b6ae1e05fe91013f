use std::io::{self, Write};

use crate::{source, CodeMap, Probe};

/// Column layout shared by the header and every source line.
fn row(lineno: &dyn std::fmt::Display, mem: &str, inc: &str, contents: &str) -> String {
    format!("{:>6} {:>12} {:>12}   {}", lineno, mem, inc, contents)
}

fn format_mib(value: f64, precision: usize) -> String {
    format!("{:>width$.prec$} MiB", value, width = precision + 4, prec = precision)
}

/// Write the line-by-line report of `code_map` to `stream`.
///
/// `precision` is the number of digits after the decimal point.
pub fn show_results<P, W>(code_map: &CodeMap<P>, stream: &mut W, precision: usize) -> io::Result<()>
where
    P: Probe,
    W: Write + ?Sized,
{
    for block in code_map.iter() {
        let header = row(&"Line #", "Mem usage", "Increment", "Line Contents");

        write!(stream, "Filename: {}\n\n", block.file().display())?;
        writeln!(stream, "{}", header)?;
        writeln!(stream, "{}", "=".repeat(header.len()))?;

        let all_lines = match source::read_lines(block.file()) {
            Ok(lines) => lines,
            Err(err) => {
                log::error!("Could not read {}: {}", block.file().display(), err);
                write!(stream, "ERROR: Could not find file {}\n\n\n", block.file().display())?;
                continue;
            }
        };

        for (lineno, stat) in block.lines() {
            let (mem, inc) = match stat {
                Some(stat) => (
                    format_mib(stat.level, precision),
                    format_mib(stat.increment, precision),
                ),
                None => (String::new(), String::new()),
            };

            let contents = (lineno as usize)
                .checked_sub(1)
                .and_then(|index| all_lines.get(index))
                .map(|line| line.trim_end_matches(['\r', '\n']))
                .unwrap_or_default();

            writeln!(stream, "{}", row(&lineno, &mem, &inc, contents))?;
        }

        write!(stream, "\n\n")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mib_width_follows_precision() {
        assert_eq!(format_mib(12.5, 1), " 12.5 MiB");
        assert_eq!(format_mib(-3.0, 3), " -3.000 MiB");
        assert_eq!(format_mib(1024.25, 2), "1024.25 MiB");
    }

    #[test]
    fn header_layout() {
        let header = row(&"Line #", "Mem usage", "Increment", "Line Contents");

        assert_eq!(
            header,
            "Line #    Mem usage    Increment   Line Contents"
        );
        assert_eq!(header.len(), 48);
    }
}
