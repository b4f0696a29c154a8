#[macro_use] extern crate log;

use std::path::PathBuf;

use structopt::StructOpt;

mod cluster;
mod command;
mod error;

use crate::command::Execution;
use crate::error::Error;

#[derive(StructOpt)]
#[structopt(name = "harness")]
struct Opt {
    /// Scenario file to execute
    #[structopt(short = "f", long = "file", parse(from_os_str))]
    file: PathBuf,

    /// Log verbosity (repeat for more)
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,
}

fn setup_logger(verbose: u8) -> Result<(), Error> {
    let level = match verbose {
    | 0 => log::LevelFilter::Warn,
    | 1 => log::LevelFilter::Info,
    | 2 => log::LevelFilter::Debug,
    | _ => log::LevelFilter::Trace,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}][{}] {}", record.level(), record.target(), message))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

async fn run(opt: Opt) -> Result<(), Error> {
    setup_logger(opt.verbose)?;

    let file = std::fs::File::open(&opt.file)?;
    let execution: Execution = serde_json::from_reader(std::io::BufReader::new(file))?;
    let cluster = cluster::Cluster::start(&execution.cluster)?;

    let mut result = Ok(());
    for command in execution.commands {
        println!("Executing command {:?}", command);
        if let Err(error) = cluster.run(command).await {
            result = Err(error);
            break
        }
    }

    cluster.stop();
    result
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    if let Err(error) = run(opt).await {
        eprintln!("harness: {}", error);
        std::process::exit(1);
    }
}
