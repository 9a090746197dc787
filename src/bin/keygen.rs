//! Ed25519 keypair generation tool for hub/operator trust roots.
//!
//! Usage:
//!   cargo run --bin signet-keygen -- --name operator-1 --output ./keys/

use clap::Parser;
use signet::Keypair;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "signet-keygen", version, about = "Ed25519 keypair generator")]
struct Args {
    /// Identity name (used only for output filenames).
    #[arg(short, long)]
    name: String,

    /// Output directory for keys.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

fn main() {
    let args = Args::parse();

    let keypair = Keypair::generate();
    let public = keypair.public_key();

    fs::create_dir_all(&args.output).expect("failed to create output directory");

    let secret_path = args.output.join(format!("{}_secret.key", args.name));
    fs::write(&secret_path, keypair.secret_bytes()).expect("failed to write secret key");

    let public_path = args.output.join(format!("{}_public.key", args.name));
    fs::write(&public_path, public).expect("failed to write public key");

    println!("Identity: {}", args.name);
    println!("Secret key saved to: {} (keep private)", secret_path.display());
    println!("Public key saved to: {}", public_path.display());
    println!("Public key (hex): {}", hex::encode(public));

    let test_message = b"signet keygen self-test";
    let signature = keypair.sign(test_message);
    match signet::crypto::verify_one(&public, test_message, &signature) {
        Ok(()) => println!("Signature self-test: PASSED"),
        Err(err) => {
            eprintln!("Signature self-test: FAILED ({err})");
            std::process::exit(1);
        }
    }

    println!();
    println!("Add the public key above to the peer's compiled-in trust root.");
}
