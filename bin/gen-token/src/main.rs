use clap::{App, Arg};
use flux::crypto;
use flux::session::server::SessionKey;
use serde_derive::Serialize;
use std::fs;

/// Wrapper matching the shape `MsgServerConfig`/`Config` expect under their `session_key` /
/// `password` fields, so the generated file can be dropped straight into a config directory.
#[derive(Serialize)]
struct KeyFile {
    session_key: SessionKey,
}

pub fn main() {
    let matches = App::new("gen-token")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Generates a random session key for seeding a shared secret between a token-issuing front-end and the session layer.")
        .arg(
            Arg::with_name("OUT_FILE")
                .help("Path to write the generated key as TOML. Prints to stdout if omitted.")
                .required(false),
        )
        .get_matches();

    let mut key = [0u8; SessionKey::SIZE];
    crypto::random_bytes(&mut key);

    let key_file = KeyFile {
        session_key: SessionKey::new(key),
    };

    let rendered = serdeconv::to_toml_string(&key_file).expect("session key must serialize to toml");

    match matches.value_of("OUT_FILE") {
        Some(path) => fs::write(path, rendered).expect("failed writing key file"),
        None => print!("{}", rendered),
    }
}
