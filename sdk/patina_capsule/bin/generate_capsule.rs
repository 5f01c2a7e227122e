//! Executable for generating and inspecting signed UEFI FMP capsules.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use clap::{ArgGroup, CommandFactory, Parser, ValueEnum, error::ErrorKind};
use patina_capsule::{
    CapsuleBuilder, decode_capsule,
    guid::Guid,
    signing::{OpensslSigner, RsaKeySigner, SigningCapability},
};
use r_efi::efi;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

#[derive(Parser, Debug)]
#[command(version, about = "Generate a signed UEFI FMP capsule or display the contents of one.")]
#[command(group(ArgGroup::new("operation").required(true).args(["encode", "dump_info"])))]
struct Args {
    /// Input binary payload filename.
    input_file: PathBuf,
    /// Sign the input payload and wrap it in an FMP capsule.
    #[arg(short, long)]
    encode: bool,
    /// Display the headers of the input capsule.
    #[arg(long)]
    dump_info: bool,
    /// Output filename for the capsule.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Capsule flag, may be given more than once.
    #[arg(long = "capflag", value_enum)]
    capsule_flag: Vec<CapsuleFlagArg>,
    /// Capsule OEM flag, an integer between 0x0000 and 0xffff.
    #[arg(long = "capoemflag", value_parser = parse_oem_flag, default_value = "0")]
    capsule_oem_flag: u16,
    /// The FMP/ESRT GUID in registry format.
    #[arg(long, value_parser = parse_guid)]
    guid: Option<efi::Guid>,
    /// The 64-bit hardware instance.
    #[arg(long, value_parser = parse_integer, default_value = "0")]
    hardware_instance: u64,
    /// 64-bit monotonic count value bound into the signature.
    #[arg(long, value_parser = parse_integer, default_value = "0")]
    monotonic_count: u64,
    /// PEM file with the RSA-2048 private key used to sign the payload.
    #[arg(long)]
    private_key: Option<PathBuf>,
    /// Sign with the openssl executable instead of in-process.
    #[arg(long, default_value_t = false)]
    openssl: bool,
    /// Print informational messages, including the capsule headers.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CapsuleFlagArg {
    #[value(name = "PersistAcrossReset")]
    PersistAcrossReset,
    #[value(name = "InitiateReset")]
    InitiateReset,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { log::LevelFilter::Info } else { log::LevelFilter::Warn };
    env_logger::Builder::new().filter_level(level).format_timestamp(None).parse_default_env().init();

    if let Err(message) = validate(&args) {
        Args::command().error(ErrorKind::ArgumentConflict, message).exit();
    }

    log::info!("Read binary input file {}", args.input_file.display());
    let buffer = fs::read(&args.input_file).inspect_err(|e| {
        eprintln!("generate_capsule: error: can not read binary input file {}: {e}", args.input_file.display());
    })?;

    if args.encode {
        let capsule = encode(&args, &buffer)?;
        // validate() guarantees an output file for encoding.
        if let Some(output) = &args.output {
            log::info!("Write binary output file {}", output.display());
            fs::write(output, capsule).inspect_err(|e| {
                eprintln!("generate_capsule: error: can not write binary output file {}: {e}", output.display());
            })?;
        }
    } else {
        let decoded = decode_capsule(&buffer).map_err(|e| {
            eprintln!("generate_capsule: error: can not decode capsule: {e}");
            io::Error::new(io::ErrorKind::InvalidData, e)
        })?;
        print!("{}", decoded.dump_info());
    }

    log::info!("Success");
    Ok(())
}

fn validate(args: &Args) -> Result<(), String> {
    if args.encode {
        if args.guid.is_none() {
            return Err("the following option is required: --guid".into());
        }
        if args.private_key.is_none() {
            return Err("the following option is required: --private-key".into());
        }
        if args.output.is_none() {
            return Err("the following option is required for encode operations: --output".into());
        }
        if args.capsule_flag.contains(&CapsuleFlagArg::InitiateReset)
            && !args.capsule_flag.contains(&CapsuleFlagArg::PersistAcrossReset)
        {
            return Err("--capflag InitiateReset also requires --capflag PersistAcrossReset".into());
        }
    }
    if args.dump_info && args.output.is_some() {
        return Err("the following option is not supported for dump-info operations: --output".into());
    }
    Ok(())
}

fn encode(args: &Args, payload: &[u8]) -> io::Result<Vec<u8>> {
    let (Some(guid), Some(private_key)) = (args.guid, args.private_key.as_deref()) else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "missing --guid or --private-key"));
    };

    let signer = signer(private_key, args.openssl).map_err(|e| {
        eprintln!("generate_capsule: error: can not sign payload: {e}");
        io::Error::new(io::ErrorKind::Other, e)
    })?;

    CapsuleBuilder::new(guid)
        .with_hardware_instance(args.hardware_instance)
        .with_monotonic_count(args.monotonic_count)
        .with_oem_flags(args.capsule_oem_flag)
        .with_persist_across_reset(args.capsule_flag.contains(&CapsuleFlagArg::PersistAcrossReset))
        .with_initiate_reset(args.capsule_flag.contains(&CapsuleFlagArg::InitiateReset))
        .encode(payload, signer.as_ref())
        .map_err(|e| {
            eprintln!("generate_capsule: error: can not encode capsule: {e}");
            io::Error::new(io::ErrorKind::Other, e)
        })
}

fn signer(private_key: &Path, use_openssl: bool) -> patina_capsule::err::Result<Box<dyn SigningCapability>> {
    if use_openssl {
        let signer = OpensslSigner::from_env(private_key);
        log::info!("Using {}", signer.version()?);
        Ok(Box::new(signer))
    } else {
        Ok(Box::new(RsaKeySigner::from_pem_file(private_key)?))
    }
}

fn parse_integer(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| format!("{value} is not a valid integer value."))
}

fn parse_oem_flag(value: &str) -> Result<u16, String> {
    let flag = parse_integer(value)?;
    u16::try_from(flag).map_err(|_| format!("{value} must be an integer in range 0x0..0xffff"))
}

fn parse_guid(value: &str) -> Result<efi::Guid, String> {
    Guid::try_from_string(value)
        .map(|guid| guid.to_efi_guid())
        .map_err(|e| format!("{value} is not a valid registry format GUID value: {e}"))
}
