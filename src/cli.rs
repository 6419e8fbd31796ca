//! Command-line surface for the `ktally` binary.
//!
//! Three subcommands: `count` (the pipeline), `histo` and `dump` (result
//! post-processing). Validation that needs cross-option context — thread
//! accounting, buffer sizing, the reader/processor split — lives in
//! [`CountArgs::resolve`], which turns raw flags into a
//! [`CountConfig`](crate::counter::CountConfig).

use anyhow::{bail, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use tracing::{debug, warn};

use crate::config::{
    Count, COUNT_MAX, COUNT_MAX_DEFAULT, FILTER_MIN_DEFAULT, GZIP_READ_BUFFER_FACTOR, MIN_THREADS,
    WRITE_BUFFER_SIZE_DEFAULT,
};
use crate::counter::CountConfig;
use crate::processor::OutputParams;
use crate::reader::{Compression, FileKind};

#[derive(Parser, Debug)]
#[command(name = "ktally", version, about = "Count k-mers.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Count canonical k-mers into a binary result file
    Count(CountArgs),
    /// Generate a histogram for counted k-mers
    Histo(HistoArgs),
    /// Dump the k-mer counting result as text
    Dump(DumpArgs),
}

#[derive(Args, Debug)]
#[command(group = ArgGroup::new("format").required(true).args(["fa", "fq"]))]
pub struct CountArgs {
    /// Length of K-mer
    #[arg(short = 'k', long = "kmer-len", value_name = "LENGTH")]
    pub kmer_len: usize,

    /// Memory size, suffixed with M or G
    #[arg(short = 'm', long = "mem", value_name = "M/G", value_parser = parse_mem_size)]
    pub mem: usize,

    /// Threads count
    #[arg(short = 't', long = "threads", value_name = "N")]
    pub threads: Option<usize>,

    /// Output file path
    #[arg(
        short = 'o',
        long = "out",
        value_name = "OUT",
        default_value = "./ktally_output"
    )]
    pub out: String,

    /// Input FASTA format
    #[arg(long)]
    pub fa: bool,

    /// Input FASTQ format
    #[arg(long)]
    pub fq: bool,

    /// Input GZIP compressed files
    #[arg(long)]
    pub gz: bool,

    /// Max count value
    #[arg(long = "count-max", value_name = "N", default_value_t = COUNT_MAX_DEFAULT)]
    pub count_max: Count,

    /// Filter min value
    #[arg(long = "filter-min", value_name = "N", default_value_t = FILTER_MIN_DEFAULT)]
    pub filter_min: Count,

    /// Filter max value
    #[arg(long = "filter-max", value_name = "N")]
    pub filter_max: Option<Count>,

    /// Log file
    #[arg(long = "log", value_name = "FILE")]
    pub log: Option<String>,

    /// Read buffer size in bytes
    #[arg(long = "bs", value_name = "SIZE")]
    pub buffer_size: Option<u32>,

    /// Reading threads count
    #[arg(long = "rt", value_name = "N")]
    pub reading_threads: Option<usize>,

    /// Input files
    #[arg(value_name = "FILE", required = true)]
    pub files: Vec<String>,
}

#[derive(Args, Debug)]
pub struct HistoArgs {
    /// Output histo file path
    #[arg(
        short = 'o',
        long = "out",
        value_name = "OUT",
        default_value = "./ktally_histo.txt"
    )]
    pub out: String,

    /// Result file produced by `count`
    #[arg(value_name = "RESULT")]
    pub result: String,
}

#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Output dump file path
    #[arg(
        short = 'o',
        long = "out",
        value_name = "OUT",
        default_value = "./ktally_dump.txt"
    )]
    pub out: String,

    /// Result file produced by `count`
    #[arg(value_name = "RESULT")]
    pub result: String,
}

/// Parses `N[M|G]` memory sizes with decimal multipliers.
fn parse_mem_size(arg: &str) -> Result<usize, String> {
    let multiplier = match arg.chars().last() {
        Some('M' | 'm') => 1_000_000usize,
        Some('G' | 'g') => 1_000_000_000,
        _ => return Err(format!("Memory size not ends with M/G: {arg}.")),
    };

    let number: usize = arg[..arg.len() - 1]
        .parse()
        .map_err(|_| format!("Memory size value invalid: {arg}."))?;
    if number == 0 {
        return Err(format!("Memory size value invalid: {arg}."));
    }

    Ok(number * multiplier)
}

impl CountArgs {
    /// Applies cross-option validation and sizing defaults.
    pub fn resolve(&self) -> Result<CountConfig> {
        if self.kmer_len == 0 {
            bail!("K-mer length value invalid: 0.");
        }
        if self.count_max == 0 {
            bail!("Count max value invalid: 0.");
        }
        if self.filter_min == 0 {
            bail!("Filter min value invalid: 0.");
        }

        let threads_count = self.threads.unwrap_or_else(num_cpus::get);
        if threads_count < MIN_THREADS {
            bail!("Threads count cannot be less than {MIN_THREADS}.");
        }
        let processing_threads_count = threads_count - 2;

        let input_compression = if self.gz {
            Compression::Gzip
        } else {
            Compression::Plain
        };
        let input_kind = if self.fa {
            FileKind::Fasta
        } else {
            FileKind::Fastq
        };

        let reading_threads_count_provided = self.reading_threads.is_some();
        let mut reading_threads_count = match self.reading_threads {
            Some(0) => bail!("Reading threads count cannot be less than 1."),
            Some(n) => n,
            None => match input_compression {
                Compression::Gzip => processing_threads_count.div_ceil(8),
                Compression::Plain => 1,
            },
        };

        if self.files.len() < reading_threads_count {
            reading_threads_count = self.files.len();
            if reading_threads_count_provided {
                warn!("Reduce reading threads count to number of files: {reading_threads_count}");
            }
        }

        let write_buffer_size = WRITE_BUFFER_SIZE_DEFAULT as usize;
        let read_buffer_size = match self.buffer_size {
            Some(0) => bail!("Buffer size cannot be 0."),
            Some(n) => n as usize,
            None => match input_compression {
                Compression::Gzip => write_buffer_size * GZIP_READ_BUFFER_FACTOR as usize,
                Compression::Plain => write_buffer_size,
            },
        };

        let config = CountConfig {
            k: self.kmer_len,
            threads_count,
            reading_threads_count,
            processing_threads_count,
            input_files: self.files.clone(),
            input_kind,
            input_compression,
            output_file_name: self.out.clone(),
            read_buffer_size,
            read_buffers_count: processing_threads_count * 2,
            write_buffer_size,
            write_buffers_count: processing_threads_count * 2,
            mem_limit: self.mem,
            output: OutputParams {
                count_max: self.count_max,
                filter_min: self.filter_min,
                filter_max: self.filter_max.unwrap_or(COUNT_MAX),
            },
        };

        debug!("K: {}", config.k);
        debug!(
            "Threads count(r/p): {}({}/{})",
            config.threads_count, config.reading_threads_count, config.processing_threads_count
        );
        debug!("Memory limit: {}", config.mem_limit);
        for (i, file) in config.input_files.iter().enumerate() {
            debug!("Input file #{i}: {file}");
        }
        debug!(
            "Input file type: {:?}, compression type: {:?}",
            config.input_kind, config.input_compression
        );
        debug!("Output files: {}", config.output_file_name);
        debug!(
            "Buffer size(r/w): {}/{}, count(r/w): {}/{}",
            config.read_buffer_size,
            config.write_buffer_size,
            config.read_buffers_count,
            config.write_buffers_count
        );
        debug!(
            "Count max: {}, filter min: {}, max: {}",
            config.output.count_max, config.output.filter_min, config.output.filter_max
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args(extra: &[&str]) -> Vec<String> {
        let mut argv = vec![
            "ktally".to_owned(),
            "count".to_owned(),
            "-k".to_owned(),
            "21".to_owned(),
            "-m".to_owned(),
            "500M".to_owned(),
            "--fa".to_owned(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        argv.push("reads.fa".to_owned());
        argv
    }

    fn parse_count(argv: Vec<String>) -> CountArgs {
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Count(args) => args,
            _ => panic!("expected count subcommand"),
        }
    }

    #[test]
    fn mem_size_suffixes() {
        assert_eq!(parse_mem_size("500M").unwrap(), 500_000_000);
        assert_eq!(parse_mem_size("2g").unwrap(), 2_000_000_000);
        assert!(parse_mem_size("500").is_err());
        assert!(parse_mem_size("0M").is_err());
        assert!(parse_mem_size("xG").is_err());
    }

    #[test]
    fn format_flag_is_required() {
        let argv = vec![
            "ktally", "count", "-k", "21", "-m", "500M", "reads.fa",
        ];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn resolve_applies_defaults() {
        let args = parse_count(base_args(&["-t", "6"]));
        let config = args.resolve().unwrap();
        assert_eq!(config.processing_threads_count, 4);
        assert_eq!(config.reading_threads_count, 1);
        assert_eq!(config.read_buffer_size, 5_000_000);
        assert_eq!(config.write_buffer_size, 5_000_000);
        assert_eq!(config.read_buffers_count, 8);
        assert_eq!(config.output.count_max, 255);
        assert_eq!(config.output.filter_min, 2);
        assert_eq!(config.output.filter_max, u32::MAX);
    }

    #[test]
    fn gzip_scales_readers_and_buffers() {
        let args = parse_count(base_args(&["-t", "19", "--gz"]));
        let config = args.resolve().unwrap();
        // 17 processors → ⌈17/8⌉ readers, capped at the single input file.
        assert_eq!(config.reading_threads_count, 1);
        assert_eq!(config.read_buffer_size, 20_000_000);
    }

    #[test]
    fn too_few_threads_is_rejected() {
        let args = parse_count(base_args(&["-t", "2"]));
        assert!(args.resolve().is_err());
    }
}
