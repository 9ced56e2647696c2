/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::Parser;
use log::{info, LevelFilter};
use std::error::Error;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use webserv::app;
use webserv::config::Config;
use webserv::core::log::{
    ensure_init_simple_logger, get_simple_logger, local_offset_check, Logger,
};

#[derive(Parser, Debug)]
#[command(name = "webserv", version, about = "Event-driven HTTP/1.x server.")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(value_name = "file")]
    config: PathBuf,

    /// Set path to the log file
    #[arg(short = 'l', long = "logfile", value_name = "file")]
    log_file: Option<PathBuf>,

    /// Set log level (0-4)
    #[arg(
        short = 'L',
        long = "loglevel",
        value_name = "x",
        default_value_t = 2,
        value_parser = clap::value_parser!(u8).range(0..=4)
    )]
    log_level: u8,
}

fn open_log_file(path: &Path) -> Result<File, io::Error> {
    OpenOptions::new().append(true).create(true).open(path)
}

fn process_args_and_run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    let log_file = match &args.log_file {
        Some(path) => match open_log_file(path) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("unable to open log file ({}). logging to standard out.", e);
                None
            }
        },
        None => None,
    };

    ensure_init_simple_logger(log_file);
    log::set_logger(get_simple_logger()).map_err(|e| e.to_string())?;

    let level = match args.log_level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    log::set_max_level(level);

    local_offset_check();

    info!("using config: {}", args.config.display());

    let config = Config::from_file(&args.config)?;

    app::run(&config, Logger::global())
}

fn main() {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            process::exit(1);
        }
        Err(e) => e.exit(),
    };

    if let Err(e) = process_args_and_run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
