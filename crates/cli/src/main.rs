use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
    process::{Command, ExitCode},
    time::Duration,
};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use hala_mprof::{watch_command, watch_pid, Backend, SampleTarget, Usage, WatchOptions};

mod dat;

#[derive(Parser, Debug)]
#[command(name = "mprof", version, about = "Record the memory usage of a program over time")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a program and sample its memory usage until it exits
    Run(RunArgs),
    /// Sample an already running process
    Attach {
        pid: u32,

        #[command(flatten)]
        sampling: Sampling,
    },
    /// Print the largest reading of recorded data files
    Peak {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct Sampling {
    /// Seconds between two readings
    #[arg(short = 'T', long, default_value_t = 0.1)]
    interval: f64,

    /// Stop sampling after this many seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Add the memory of all descendant processes
    #[arg(short = 'C', long)]
    include_children: bool,

    /// Memory backend: process-table, external-probe or snapshot
    #[arg(short, long)]
    backend: Option<Backend>,

    /// Keep only the largest reading
    #[arg(short = 'M', long)]
    max_usage: bool,

    /// Print the readings as JSON instead of writing a data file
    #[arg(long)]
    json: bool,
}

impl Sampling {
    fn options(&self) -> anyhow::Result<WatchOptions> {
        if !(self.interval > 0.0 && self.interval.is_finite()) {
            bail!("invalid interval {}", self.interval);
        }

        let mut options = WatchOptions::default()
            .interval(Duration::from_secs_f64(self.interval))
            .include_children(self.include_children)
            .max_usage(self.max_usage)
            .timestamps(true);

        if let Some(timeout) = self.timeout {
            let timeout = Duration::try_from_secs_f64(timeout)
                .with_context(|| format!("invalid timeout {}", timeout))?;

            options = options.timeout(timeout);
        }

        if let Some(backend) = self.backend {
            options = options.backend(backend);
        }

        Ok(options)
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    sampling: Sampling,

    /// Data file, `mprofile_<timestamp>.dat` by default
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Exit with the exit code of the program
    #[arg(short = 'E', long)]
    exit_code: bool,

    /// The program to run and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    program: Vec<String>,
}

fn default_output() -> PathBuf {
    chrono::Local::now()
        .format("mprofile_%Y%m%d%H%M%S.dat")
        .to_string()
        .into()
}

fn print_json(usage: &Usage) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(usage)?;

    println!("{}", json);

    Ok(())
}

fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let options = args.sampling.options()?;

    let [program, params @ ..] = args.program.as_slice() else {
        bail!("no program to run");
    };

    let mut command = Command::new(program);
    command.args(params);

    let status = if args.sampling.json || args.sampling.max_usage {
        let (usage, status) = watch_command(command, &options, None)
            .with_context(|| format!("watching `{}`", program))?;

        print_json(&usage)?;

        status
    } else {
        let path = args.output.unwrap_or_else(default_output);
        let file = File::create(&path).with_context(|| path.display().to_string())?;
        let mut file = BufWriter::new(file);

        dat::write_cmdline(&mut file, &args.program).with_context(|| path.display().to_string())?;

        let (usage, status) = watch_command(command, &options, Some(&mut file))
            .with_context(|| format!("watching `{}`", program))?;

        file.flush().with_context(|| path.display().to_string())?;

        if let Usage::Streamed(count) = usage {
            log::info!("{} readings written to {}", count, path.display());
        }

        status
    };

    log::debug!("{} exited with {}", program, status);

    if !args.exit_code {
        return Ok(ExitCode::SUCCESS);
    }

    // killed by a signal
    let code = status.code().unwrap_or(1);

    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

fn attach(pid: u32, sampling: Sampling) -> anyhow::Result<ExitCode> {
    let options = sampling.options()?;
    let usage = watch_pid(SampleTarget::Pid(pid), &options)
        .with_context(|| format!("sampling process {}", pid))?;

    if sampling.json {
        print_json(&usage)?;
    } else {
        let mut stdout = io::stdout().lock();

        dat::write_usage(&mut stdout, &usage)?;
    }

    Ok(ExitCode::SUCCESS)
}

fn peak(files: Vec<PathBuf>) -> anyhow::Result<ExitCode> {
    for path in files {
        let text = std::fs::read_to_string(&path).with_context(|| path.display().to_string())?;

        match dat::peak(&text) {
            Some(peak) => println!("{}\t{:.3} MiB", path.display(), peak),
            None => log::warn!("{} holds no readings", path.display()),
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    pretty_env_logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Attach { pid, sampling } => attach(pid, sampling),
        Commands::Peak { files } => peak(files),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            log::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_arguments() {
        let cli = Cli::try_parse_from([
            "mprof", "run", "-T", "0.5", "--timeout", "3", "-C", "--backend", "psutil", "-E",
            "python", "-c", "print(1)",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        assert_eq!(args.program, ["python", "-c", "print(1)"]);
        assert!(args.exit_code);
        assert_eq!(args.sampling.backend, Some(Backend::ProcessTable));

        let options = args.sampling.options().unwrap();

        assert_eq!(options.interval, Duration::from_millis(500));
        assert_eq!(options.iteration_limit(), Some(6));
        assert!(options.include_children);
        assert!(options.timestamps);
    }

    #[test]
    fn errors_keep_their_source() {
        let err = peak(vec![PathBuf::from("/no/such/mprofile.dat")]).unwrap_err();

        assert_eq!(err.to_string(), "/no/such/mprofile.dat");
        assert!(err.root_cause().downcast_ref::<io::Error>().is_some());

        let cli = Cli::try_parse_from(["mprof", "run", "--json", "/no/such/program"]).unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        let err = run(args).unwrap_err();

        assert!(err.to_string().contains("/no/such/program"));
        assert!(err.chain().any(|cause| matches!(
            cause.downcast_ref::<hala_mprof::Error>(),
            Some(hala_mprof::Error::Spawn { .. })
        )));
    }

    #[test]
    fn program_is_required() {
        assert!(Cli::try_parse_from(["mprof", "run"]).is_err());
    }

    #[test]
    fn invalid_interval() {
        let cli = Cli::try_parse_from(["mprof", "attach", "1", "-T", "0"]).unwrap();

        let Commands::Attach { sampling, .. } = cli.command else {
            panic!("expected attach");
        };

        assert!(sampling.options().is_err());
    }
}
