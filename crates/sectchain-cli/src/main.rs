use anyhow::{Context, Result};
use clap::Parser;
use log::debug;
use sectchain_core::inject::{DEFAULT_PAD_SIZE, DEFAULT_SECTION_NAME};
use sectchain_core::pe::PeFile;
use sectchain_core::{inject_bytes, InjectOptions, InjectReport};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "sectchain", version, about = "Append a payload PE as a new entry section")]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Silence log output
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Inject PAYLOAD into HOST and write the result to OUTPUT
    Inject {
        /// Original (backed-up) host image
        host: PathBuf,
        /// Payload image to embed
        payload: PathBuf,
        /// Output image path
        #[arg(short, long)]
        output: PathBuf,
        /// Name of the appended section
        #[arg(long, default_value = DEFAULT_SECTION_NAME)]
        section_name: String,
        /// Landing pad size in front of the payload (hex with 0x, or decimal)
        #[arg(long, value_parser = parse_u32, default_value_t = DEFAULT_PAD_SIZE)]
        pad_size: u32,
        /// Require payload section and file alignment to equal this value
        #[arg(long, value_parser = parse_u32)]
        require_alignment: Option<u32>,
        /// Require payload ImageBase to match the RVA it is placed at
        #[arg(long)]
        check_base: bool,
        /// Recompute the optional-header checksum of the output
        #[arg(long)]
        update_checksum: bool,
        /// Compute and print the layout without writing OUTPUT
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the header summary and section table of an image
    Info {
        /// Image to inspect
        image: PathBuf,
    },
}

/// Accept `0x`-prefixed hex or plain decimal.
fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read '{}'", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    stderrlog::new()
        .module(module_path!())
        .module("sectchain_core")
        .quiet(cli.quiet)
        .verbosity(cli.verbose as usize + 1)
        .init()
        .context("failed to initialise logging")?;

    match cli.command {
        Command::Inject {
            host,
            payload,
            output,
            section_name,
            pad_size,
            require_alignment,
            check_base,
            update_checksum,
            dry_run,
        } => {
            let opts = InjectOptions {
                section_name,
                pad_size,
                require_payload_alignment: require_alignment,
                check_payload_base: check_base,
                update_checksum,
                ..InjectOptions::default()
            };
            cmd_inject(&host, &payload, &output, &opts, dry_run)
        }
        Command::Info { image } => cmd_info(&image),
    }
}

fn cmd_inject(
    host: &Path,
    payload: &Path,
    output: &Path,
    opts: &InjectOptions,
    dry_run: bool,
) -> Result<()> {
    println!("sectchain v{}", env!("CARGO_PKG_VERSION"));
    println!("────────────────────────────────────────");
    println!("Host:    {}", host.display());
    println!("Payload: {}", payload.display());
    println!("Output:  {}", output.display());
    println!();

    let host_data = read_image(host)?;
    let payload_data = read_image(payload)?;
    let original_size = host_data.len();
    debug!(
        "read {} host bytes, {} payload bytes",
        original_size,
        payload_data.len()
    );

    let injected = inject_bytes(host_data, payload_data, opts)
        .with_context(|| format!("failed to inject {} section", opts.section_name))?;
    print_report(&injected.report);

    if dry_run {
        println!();
        println!("[*] Dry run: {} not written", output.display());
        return Ok(());
    }

    fs::write(output, &injected.image)
        .with_context(|| format!("failed to write '{}'", output.display()))?;

    println!();
    println!(
        "[+] Wrote {} ({} -> {} bytes)",
        output.display(),
        original_size,
        injected.image.len()
    );
    Ok(())
}

fn print_report(report: &InjectReport) {
    println!(
        "[*] Payload entry 0x{:08X} now chains to host entry 0x{:08X}",
        report.payload_entry, report.old_entry_point
    );
    println!(
        "[+] Section {}: RVA 0x{:08X} size 0x{:X}, raw 0x{:X} size 0x{:X}",
        report.section_name,
        report.virtual_address,
        report.virtual_size,
        report.raw_offset,
        report.raw_size
    );
    if report.trailing_data > 0 {
        println!(
            "[!] Host carried 0x{:X} trailing bytes (signature/overlay); section placed after them",
            report.trailing_data
        );
    }
    println!(
        "[+] Entry point: 0x{:08X} -> 0x{:08X}",
        report.old_entry_point, report.new_entry_point
    );
    println!(
        "[+] SizeOfImage: 0x{:X} -> 0x{:X}",
        report.old_size_of_image, report.new_size_of_image
    );
    println!("[+] Sections: {}", report.section_count);
    if let Some(checksum) = report.checksum {
        println!("[+] Checksum: 0x{:08X}", checksum);
    }
}

fn cmd_info(path: &Path) -> Result<()> {
    let data = read_image(path)?;
    let pe = PeFile::parse(data)
        .with_context(|| format!("failed to parse '{}'", path.display()))?;
    let opt = &pe.optional_header;

    println!("{}", path.display());
    println!("────────────────────────────────────────");
    println!("Machine:           0x{:04X}", pe.coff_header.machine);
    println!("Entry point:       0x{:08X}", opt.entry_point);
    println!("Image base:        0x{:016X}", opt.image_base);
    println!("Section alignment: 0x{:X}", opt.section_alignment);
    println!("File alignment:    0x{:X}", opt.file_alignment);
    println!("Size of image:     0x{:X}", opt.size_of_image);
    println!("Size of headers:   0x{:X}", opt.size_of_headers);
    println!(
        "Checksum:          0x{:08X} ({})",
        opt.checksum,
        if pe.checksum_is_valid() { "valid" } else { "stale" }
    );
    println!("File size:         0x{:X}", pe.end_of_file());
    println!(
        "Header room:       {} of {} section slots used",
        pe.sections.len(),
        pe.section_table_capacity()
    );
    if pe.trailing_data_len() > 0 {
        println!("Trailing data:     0x{:X} bytes", pe.trailing_data_len());
    }
    println!();
    println!("  #  Name      VirtAddr  VirtSize  RawOff    RawSize   Flags");
    for (i, s) in pe.sections.iter().enumerate() {
        println!(
            "  {:<2} {:<8}  {:08X}  {:08X}  {:08X}  {:08X}  {:08X}",
            i,
            s.name_str(),
            s.virtual_address,
            s.virtual_size,
            s.pointer_to_raw_data,
            s.size_of_raw_data,
            s.characteristics
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_u32_accepts_hex_and_decimal() {
        assert_eq!(parse_u32("0x1000"), Ok(0x1000));
        assert_eq!(parse_u32("0X200"), Ok(0x200));
        assert_eq!(parse_u32("4096"), Ok(4096));
        assert!(parse_u32("0xZZ").is_err());
        assert!(parse_u32("-1").is_err());
    }

    #[test]
    fn cli_defaults_match_library_defaults() {
        let cli = Cli::try_parse_from(["sectchain", "inject", "a.efi", "b.efi", "-o", "c.efi"])
            .expect("args parse");
        match cli.command {
            Command::Inject {
                section_name,
                pad_size,
                require_alignment,
                check_base,
                dry_run,
                ..
            } => {
                let defaults = InjectOptions::default();
                assert_eq!(section_name, defaults.section_name);
                assert_eq!(pad_size, defaults.pad_size);
                assert_eq!(require_alignment, None);
                assert!(!check_base);
                assert!(!dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_verify_structure() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
