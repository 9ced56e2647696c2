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

use crate::config::Config;
use crate::core::log::Logger;
use crate::handler::{DefaultHandler, DefaultRenderer};
use crate::reactor::{Reactor, ReactorError};
use signal_hook::consts::{SIGCHLD, TERM_SIGNALS};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct App {
    reactor: Reactor,
}

impl App {
    pub fn new(config: &Config, log: Logger) -> Result<Self, Box<dyn Error>> {
        ignore_sigpipe();

        let reactor = Reactor::new(
            config,
            Box::new(DefaultHandler::new(log.clone())),
            Box::new(DefaultRenderer::new(
                "webserv",
                log.with_target("webserv::render"),
            )),
            log,
        )?;

        let stop = reactor.stop_handle();

        // ensure two term signals in a row causes the app to immediately exit
        for signal_type in TERM_SIGNALS {
            signal_hook::flag::register_conditional_shutdown(
                *signal_type,
                1, // exit code
                Arc::clone(&stop),
            )?;

            signal_hook::flag::register(*signal_type, Arc::clone(&stop))?;
        }

        signal_hook::flag::register(SIGCHLD, reactor.children_handle())?;

        Ok(Self { reactor })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.reactor.local_addrs()
    }

    /// Serve until a termination signal arrives.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        self.reactor.run()
    }
}

// writes to a closed peer must fail with EPIPE instead of killing us
fn ignore_sigpipe() {
    // SAFETY: installs the predefined ignore disposition
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

pub fn run(config: &Config, log: Logger) -> Result<(), Box<dyn Error>> {
    log.info(format_args!("starting..."));

    {
        let mut a = App::new(config, log.clone())?;

        log.info(format_args!("started"));

        a.run()?;

        log.info(format_args!("stopping..."));
    }

    log.info(format_args!("stopped"));

    Ok(())
}
