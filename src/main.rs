use clap::{Arg, ArgAction, Command, value_parser};
use clap_num::maybe_hex;
use exhume_body::Body;
use exhume_mft::paths::{find_by_path, reconstruct_paths};
use exhume_mft::reader::ReadSeek;
use exhume_mft::sink::{ConsoleSink, JsonLinesSink, RecordSink};
use exhume_mft::{FileRecord, MftScanner, ScanError, ScanOptions, gpt};
use log::{debug, error, info};
use serde_json::{Value, json};
use std::fs::File;
use std::io::{self, BufWriter, Write};

fn open_device(path: &str, format: &str) -> Result<Box<dyn ReadSeek>, ScanError> {
    // Opening read-only first gives a clean error instead of a failure deep inside Body.
    let file = File::open(path).map_err(|e| ScanError::DeviceOpen(path.to_string(), e))?;
    if format == "raw" {
        debug!("Reading '{}' as a raw device", path);
        return Ok(Box::new(file));
    }
    drop(file);
    let body = Body::new(path.to_owned(), format);
    debug!("Created Body from '{}'", path);
    Ok(Box::new(body))
}

fn collect_with_paths(
    scanner: &mut MftScanner<Box<dyn ReadSeek>>,
) -> Result<Vec<FileRecord>, ScanError> {
    let mut records: Vec<FileRecord> = Vec::new();
    scanner.scan(&mut records)?;
    reconstruct_paths(&mut records);
    Ok(records)
}

fn run(matches: &clap::ArgMatches) -> Result<(), ScanError> {
    let device = matches.get_one::<String>("body").unwrap();
    let format = matches.get_one::<String>("format").unwrap();
    let json_output = matches.get_flag("json");

    let options = ScanOptions {
        block_size: *matches.get_one::<u64>("block_size").unwrap(),
        record_size: *matches.get_one::<usize>("record_size").unwrap(),
        skip_records: *matches.get_one::<u64>("skip").unwrap(),
        unicode_names: matches.get_flag("unicode_names"),
        full_data_runs: matches.get_flag("full_runs"),
    };
    debug!("Scan options: {:?}", options);

    let body = open_device(device, format)?;
    let mut scanner = match matches.get_one::<u64>("offset") {
        Some(offset) => MftScanner::open_at(body, *offset, options)?,
        None => MftScanner::open(body, options)?,
    };

    if matches.get_flag("partitions") {
        match &scanner.layout {
            Some(layout) if json_output => println!(
                "{}",
                serde_json::to_string_pretty(&gpt::partitions_to_json(&layout.partitions))?
            ),
            Some(layout) => println!("{}", gpt::partitions_to_string(&layout.partitions)),
            None => error!("--partitions needs GPT discovery, it is ignored with --offset"),
        }
    }

    if matches.get_flag("pbs") {
        if json_output {
            println!("{}", serde_json::to_string_pretty(&scanner.pbs.to_json())?);
        } else {
            println!("{}", scanner.pbs.to_string());
        }
    }

    if let Some(query) = matches.get_one::<String>("find") {
        info!("Fetching file location info for: {}", query);
        let records = collect_with_paths(&mut scanner)?;
        let hits = find_by_path(&records, query);
        if hits.is_empty() {
            error!("No matching entry found for '{}'", query);
            std::process::exit(1);
        }
        if json_output {
            let arr: Vec<Value> = hits.iter().map(|r| r.to_json()).collect();
            println!("{}", serde_json::to_string_pretty(&json!({ "matches": arr }))?);
        } else {
            for hit in hits {
                println!("{}", hit.to_string());
            }
        }
        return Ok(());
    }

    match matches.get_one::<String>("mode").map(String::as_str) {
        Some("print") => {
            info!("Dumping MFT entries to screen...");
            let stdout = io::stdout();
            let mut sink = ConsoleSink::new(stdout.lock());
            let summary = scanner.scan(&mut sink)?;
            info!(
                "{} extents, {} records visited, {} printed",
                summary.extents, summary.records_visited, summary.records_emitted
            );
        }
        Some("store") => {
            let output = matches.get_one::<String>("output").unwrap();
            let batch_size = *matches.get_one::<usize>("batch_size").unwrap();
            let records = collect_with_paths(&mut scanner)?;
            let writer: Box<dyn Write> = if output == "-" {
                Box::new(io::stdout().lock())
            } else {
                let file = File::create(output)
                    .map_err(|e| ScanError::Sink(format!("cannot create '{}': {}", output, e)))?;
                Box::new(BufWriter::new(file))
            };
            let mut sink = JsonLinesSink::new(writer, batch_size);
            for record in records {
                sink.accept(record)?;
            }
            sink.finish()?;
            info!("{} records written to {}", sink.committed(), output);
        }
        _ => {
            if !matches.get_flag("pbs") && !matches.get_flag("partitions") {
                error!("No valid mode selected. Use --mode, --find, --pbs or --partitions.");
            }
        }
    }
    Ok(())
}

fn main() {
    let matches = Command::new("exhume_mft")
        .version("0.1.0")
        .author("ForensicXlab")
        .about("Rebuild the file inventory of an NTFS volume straight from the raw device.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The device or disk image to read (never written)."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(["raw", "ewf", "auto"])
                .default_value("auto")
                .help("The format of the body, either 'raw', 'ewf' or 'auto'."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .help("Byte offset of the NTFS partition (decimal or hex). Skips GPT discovery."),
        )
        .arg(
            Arg::new("block_size")
                .long("block-size")
                .value_parser(maybe_hex::<u64>)
                .default_value("512")
                .help("Logical block size used to address the GPT."),
        )
        .arg(
            Arg::new("record_size")
                .long("record-size")
                .value_parser(maybe_hex::<usize>)
                .default_value("1024")
                .help("Size of one MFT record in bytes."),
        )
        .arg(
            Arg::new("skip")
                .long("skip")
                .value_parser(maybe_hex::<u64>)
                .default_value("26")
                .help("Reserved metafile records skipped at the start of the first MFT extent."),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_parser(["print", "store"])
                .help("print: one line per record on screen; store: JSON lines with full paths."),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .value_parser(value_parser!(String))
                .default_value("mft_records.jsonl")
                .help("Destination of --mode store ('-' for stdout)."),
        )
        .arg(
            Arg::new("batch_size")
                .long("batch-size")
                .value_parser(value_parser!(usize))
                .default_value("10000")
                .help("Records per committed batch in store mode."),
        )
        .arg(
            Arg::new("find")
                .long("find")
                .value_parser(value_parser!(String))
                .help("Look up a file by its full path and print where its content lives."),
        )
        .arg(
            Arg::new("pbs")
                .long("pbs")
                .action(ArgAction::SetTrue)
                .help("Display the partition boot sector information."),
        )
        .arg(
            Arg::new("partitions")
                .long("partitions")
                .action(ArgAction::SetTrue)
                .help("Display the GPT partition entries."),
        )
        .arg(
            Arg::new("unicode_names")
                .long("unicode-names")
                .action(ArgAction::SetTrue)
                .help("Decode file names as full UTF-16 instead of keeping ASCII bytes only."),
        )
        .arg(
            Arg::new("full_runs")
                .long("full-runs")
                .action(ArgAction::SetTrue)
                .help("Resolve every data run of non-resident files, not only the first."),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Output certain structures (pbs, partitions, find) in JSON format."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    // Initialize logger.
    let log_level_str = matches.get_one::<String>("log_level").unwrap();
    let level_filter = match log_level_str.as_str() {
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(level_filter).init();

    if let Err(e) = run(&matches) {
        error!("{}", e);
        std::process::exit(1);
    }
}
