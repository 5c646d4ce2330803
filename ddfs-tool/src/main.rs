mod console;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use ddfs::key::file_name_to_key;
use ddfs::{
    erase_disk, Block, FileBlockDevice, FormatOptions, FsError, Key, KvStore, MountOptions,
    BLOCK_SIZE,
};
use log::{debug, info};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process;
use std::sync::Arc;

fn main() {
    let matches = app().get_matches();
    if let Err(err) = console::init(matches.occurrences_of("verbose")) {
        eprintln!("ddfs-tool: logger unavailable: {}", err);
    }
    let code = match run(&matches) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("ddfs-tool: {}", err);
            1
        }
    };
    process::exit(code);
}

fn image_arg() -> Arg<'static, 'static> {
    Arg::with_name("image")
        .required(true)
        .index(1)
        .help("Image file or block device")
}

fn key_arg(name: &'static str, index: u64) -> Arg<'static, 'static> {
    Arg::with_name(name)
        .required(true)
        .index(index)
        .help("Key as 40 hex characters")
}

fn value_arg(index: u64) -> Arg<'static, 'static> {
    Arg::with_name("value")
        .required(true)
        .index(index)
        .help("File holding the value, at most one block, zero padded")
}

fn app() -> App<'static, 'static> {
    App::new("ddfs-tool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Format and inspect deduplicating key-value images")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .global(true)
                .help("Raise log level, overrides DDFS_LOG"),
        )
        .subcommand(
            SubCommand::with_name("format")
                .about("Write a fresh filesystem onto the image")
                .arg(image_arg())
                .arg(
                    Arg::with_name("blocks")
                        .long("blocks")
                        .takes_value(true)
                        .help("Create the image with this many blocks when it does not exist"),
                )
                .arg(
                    Arg::with_name("inodes")
                        .long("inodes")
                        .takes_value(true)
                        .help("Inode count, defaults to the block count"),
                )
                .arg(
                    Arg::with_name("volume")
                        .long("volume")
                        .takes_value(true)
                        .help("Volume name, at most 12 bytes"),
                )
                .arg(
                    Arg::with_name("reserve-metadata")
                        .long("reserve-metadata")
                        .help("Reserve one inode per metadata block"),
                )
                .arg(
                    Arg::with_name("erase-disk")
                        .long("erase-disk")
                        .help("Zero the whole device before formatting"),
                )
                .arg(
                    Arg::with_name("force")
                        .short("f")
                        .long("force")
                        .help("Do not ask before reformatting"),
                ),
        )
        .subcommand(
            SubCommand::with_name("info")
                .about("Print the superblock")
                .arg(image_arg()),
        )
        .subcommand(
            SubCommand::with_name("put")
                .about("Store a value under a key")
                .arg(image_arg())
                .arg(key_arg("key", 2))
                .arg(value_arg(3)),
        )
        .subcommand(
            SubCommand::with_name("get")
                .about("Read the value of a key")
                .arg(image_arg())
                .arg(key_arg("key", 2))
                .arg(
                    Arg::with_name("output")
                        .short("o")
                        .long("output")
                        .takes_value(true)
                        .help("Write the block to a file instead of stdout"),
                ),
        )
        .subcommand(
            SubCommand::with_name("delete")
                .about("Drop one reference of a key")
                .arg(image_arg())
                .arg(key_arg("key", 2)),
        )
        .subcommand(
            SubCommand::with_name("rename")
                .about("Move a value to a new key")
                .arg(image_arg())
                .arg(key_arg("old", 2))
                .arg(key_arg("new", 3)),
        )
        .subcommand(
            SubCommand::with_name("modify")
                .about("Replace the value of a key")
                .arg(image_arg())
                .arg(key_arg("key", 2))
                .arg(value_arg(3)),
        )
        .subcommand(
            SubCommand::with_name("exists")
                .about("Check whether a value is already stored")
                .arg(image_arg())
                .arg(value_arg(2)),
        )
        .subcommand(
            SubCommand::with_name("check")
                .about("Verify bitmaps, counters and block pointers")
                .arg(image_arg()),
        )
}

fn run(matches: &ArgMatches) -> ddfs::Result<i32> {
    match matches.subcommand() {
        ("format", Some(args)) => format(args),
        ("info", Some(args)) => show_info(args),
        ("put", Some(args)) => {
            let kv = open_store(args)?;
            let key = key_of(args, "key")?;
            kv.create_kv_pair(&key, &read_value(args)?)?;
            println!("{} refs={}", key, kv.reference_count(&key)?);
            Ok(0)
        }
        ("get", Some(args)) => {
            let kv = open_store(args)?;
            let mut block = [0u8; BLOCK_SIZE];
            kv.get_value(&key_of(args, "key")?, &mut block)?;
            match args.value_of("output") {
                Some(path) => fs::write(path, &block[..])?,
                None => io::stdout().write_all(&block[..])?,
            }
            Ok(0)
        }
        ("delete", Some(args)) => {
            open_store(args)?.delete_kv_pair(&key_of(args, "key")?)?;
            Ok(0)
        }
        ("rename", Some(args)) => {
            let kv = open_store(args)?;
            kv.rename_key(&key_of(args, "old")?, &key_of(args, "new")?)?;
            Ok(0)
        }
        ("modify", Some(args)) => {
            let kv = open_store(args)?;
            kv.modify_value(&key_of(args, "key")?, &read_value(args)?)?;
            Ok(0)
        }
        ("exists", Some(args)) => {
            let found = open_store(args)?.block_exists(&read_value(args)?)?;
            println!("{}", if found { "present" } else { "absent" });
            Ok(if found { 0 } else { 1 })
        }
        ("check", Some(args)) => check(args),
        _ => Ok(2),
    }
}

fn image_of<'a>(args: &'a ArgMatches) -> &'a str {
    args.value_of("image").unwrap_or_default()
}

fn key_of(args: &ArgMatches, name: &str) -> ddfs::Result<Key> {
    file_name_to_key(args.value_of(name).unwrap_or_default())
}

fn open_store(args: &ArgMatches) -> ddfs::Result<KvStore> {
    let dev = Arc::new(FileBlockDevice::open(image_of(args))?);
    KvStore::open(dev, &MountOptions::default())
}

// 读取值文件，不足一个块的部分补0
fn read_value(args: &ArgMatches) -> ddfs::Result<Block> {
    let path = args.value_of("value").unwrap_or_default();
    let data = fs::read(path)?;
    if data.len() > BLOCK_SIZE {
        return Err(FsError::Device(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is {} bytes, values are at most {}", path, data.len(), BLOCK_SIZE),
        )));
    }
    let mut block = [0u8; BLOCK_SIZE];
    block[..data.len()].copy_from_slice(&data);
    Ok(block)
}

fn parse_count(args: &ArgMatches, name: &str) -> ddfs::Result<Option<u64>> {
    match args.value_of(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| FsError::InvalidGeometry(format!("--{} expects a number, got {}", name, raw))),
    }
}

#[cfg(unix)]
fn owner_uid(path: &Path) -> u32 {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).map(|m| m.uid()).unwrap_or(0)
}

#[cfg(not(unix))]
fn owner_uid(_path: &Path) -> u32 {
    0
}

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y"))
}

fn format(args: &ArgMatches) -> ddfs::Result<i32> {
    let image = image_of(args);
    let path = Path::new(image);
    let dev = if path.exists() {
        Arc::new(FileBlockDevice::open(path)?)
    } else {
        let blocks = parse_count(args, "blocks")?.ok_or_else(|| {
            FsError::InvalidGeometry(format!("{} does not exist, pass --blocks to create it", image))
        })?;
        info!("creating image {} with {} blocks", image, blocks);
        Arc::new(FileBlockDevice::create(path, blocks * BLOCK_SIZE as u64)?)
    };

    let formatted = KvStore::open(dev.clone(), &MountOptions::default()).is_ok();
    if formatted && !args.is_present("force") {
        println!("Disk {} already formatted with ddfs.", image);
        if !confirm("Do you wish to continue? [y/n] ")? {
            return Ok(0);
        }
    }
    if args.is_present("erase-disk") {
        debug!("erasing {}", image);
        erase_disk(dev.as_ref())?;
    }

    let mut options = FormatOptions::default()
        .with_uid(owner_uid(path))
        .with_reserved_metadata_inodes(args.is_present("reserve-metadata"));
    if let Some(inodes) = parse_count(args, "inodes")? {
        let inodes = u32::try_from(inodes)
            .map_err(|_| FsError::InvalidGeometry(format!("{} inodes do not fit in 32 bits", inodes)))?;
        options = options.with_inode_count(inodes);
    }
    if let Some(volume) = args.value_of("volume") {
        options = options.with_volume_name(volume);
    }
    KvStore::format(dev, &options)?;
    if formatted {
        println!("Disk {} has been reformatted.", image);
    } else {
        println!("Disk {} has been formatted.", image);
    }
    Ok(0)
}

fn show_info(args: &ArgMatches) -> ddfs::Result<i32> {
    let kv = open_store(args)?;
    let sb = kv.superblock();
    println!("name:            {}", sb.name());
    println!("volume:          {}", sb.volume_name());
    println!("magic:           {:#x}", sb.magic_number);
    println!("version:         {}", sb.version);
    println!("media size:      {}", sb.media_size);
    println!("block size:      {}", sb.block_size);
    println!("blocks:          {}", sb.block_count);
    println!("ifree blocks:    {}", sb.ifree_block_count);
    println!("bfree blocks:    {}", sb.bfree_block_count);
    println!("istore blocks:   {}", sb.istore_block_count);
    println!("data blocks:     {}", sb.data_block_count);
    println!("inode size:      {}", sb.inode_size);
    println!("inodes:          {}", sb.inode_count);
    println!("free inodes:     {}", sb.ifree_count);
    println!("free blocks:     {}", sb.bfree_count);
    println!("istore offset:   {}", sb.istore_offset);
    println!("data offset:     {}", sb.data_offset);
    println!("uid:             {}", sb.uid);
    Ok(0)
}

fn check(args: &ArgMatches) -> ddfs::Result<i32> {
    let report = open_store(args)?.check()?;
    println!(
        "{} live inodes, {} reserved, {} allocated blocks, {} referenced",
        report.live_inodes, report.reserved_inodes, report.allocated_blocks, report.referenced_blocks
    );
    for problem in report.problems.iter() {
        println!("problem: {}", problem);
    }
    Ok(if report.is_clean() { 0 } else { 2 })
}
