// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{error, info, o, Drain, Logger};

use devcomm::catalog::FieldValue;
use devcomm::config::DriverConfig;
use devcomm::delivery::DeliverySink;
use devcomm::device::{split_channel, ChannelId};
use devcomm::driver::{Driver, FolderId};
use devcomm::protocol::RawMessage;
use devcomm::scheduler::TokioScheduler;

static APP: &str = "devserve";
const DEFAULT_CYCLE_MS: u64 = 500;

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Serve devices described by a driver configuration file")
        .version(crate_version!())
        .arg(
            Arg::with_name("config")
                .help("Path to the JSON driver configuration")
                .long("config")
                .short("c")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("cycle")
                .help("Consumer cycle in milliseconds (Default: 500)")
                .long("cycle-ms")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("standby")
                .help("Start as the backup node")
                .long("standby")
                .takes_value(false),
        )
        .get_matches()
}

struct LogSink {
    log: Logger,
}

impl DeliverySink for LogSink {
    fn deliver(&self, channel: ChannelId, message: &RawMessage, handshake: bool) {
        let (device, id) = split_channel(channel);
        info!(self.log, "message";
              "device" => device, "id" => id,
              "sequence" => message.sequence_number,
              "bytes" => message.payload.len(),
              "handshake" => handshake);
    }

    fn retired(&self, channel: ChannelId) {
        let (device, id) = split_channel(channel);
        info!(self.log, "message retired"; "device" => device, "id" => id);
    }
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let matches = parse_opts(APP.to_string());
    let cycle = Duration::from_millis(
        value_t!(matches, "cycle", u64).unwrap_or(DEFAULT_CYCLE_MS),
    );
    let path = matches.value_of("config").unwrap_or_default();

    let config = DriverConfig::from_file(path).unwrap_or_else(|e| {
        error!(root_log, "failed to load configuration"; "path" => path, "err" => %e);
        process::exit(1)
    });

    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        error!(root_log, "failed to start runtime"; "err" => %e);
        process::exit(1)
    });
    let scheduler = Arc::new(TokioScheduler::new(runtime.handle().clone()));
    let sink = Arc::new(LogSink {
        log: root_log.new(o!("component" => "sink")),
    });

    let driver = Driver::new(config, scheduler, sink, None, Some(&root_log))
        .map(Arc::new)
        .unwrap_or_else(|e| {
            error!(root_log, "invalid configuration"; "err" => %e);
            process::exit(1)
        });

    driver.set_active(!matches.is_present("standby"));
    match driver.start() {
        Ok(addr) => info!(root_log, "driver started"; "address" => %addr),
        Err(e) => {
            error!(root_log, "failed to start driver"; "err" => %e);
            process::exit(1)
        }
    }
    driver.start_cycles(cycle);

    // Stand-in consumer: acknowledge every raised handshake once per cycle.
    loop {
        thread::sleep(cycle);
        for id in driver.folder_ids() {
            let channel = match id {
                FolderId::Message(c) => c,
                _ => continue,
            };
            let raised = driver
                .read(id)
                .map(|values| {
                    values.iter().any(|(name, v)| {
                        name == "handshake" && *v == FieldValue::Bool(true)
                    })
                })
                .unwrap_or(false);
            if raised {
                let _ = driver.acknowledge(channel);
            }
        }
    }
}
