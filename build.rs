use std::{
    env,
    fs::File,
    io::{BufWriter, Write},
    ops::RangeInclusive,
};

const PREFIX: &str = "BS_";

struct Config {
    name: &'static str,
    default: usize,
    range: RangeInclusive<usize>,
    doc: &'static str,
}

const CONFIGS: &[Config] = &[
    Config {
        name: "CHUNK_SHIFT",
        default: 16,
        // A chunk must hold two minimal pieces, and its size must fit in `usize`.
        range: 6..=(usize::BITS as usize - 2),
        doc: "The default chunk size of memory pools, in bits.",
    },
    Config {
        name: "SPIN_COUNT",
        default: 10_000,
        range: 0..=usize::MAX,
        doc: "The number of spins a semaphore waiter tries before parking on the OS semaphore.",
    },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("cargo sets OUT_DIR for build scripts");
    let file = File::create(format!("{out_dir}/config.rs")).expect("failed to create config.rs");
    let mut file = BufWriter::new(file);

    for config in CONFIGS {
        let value = resolve(config);
        writeln!(
            file,
            "#[doc = \"{} Defaults to `{}`; overridden by `{PREFIX}{}`.\"]\npub const {}: usize = {value};",
            config.doc, config.default, config.name, config.name,
        )
        .expect("failed to write config.rs");
    }
}

/// Reads the override of `config` from the environment, falling back to the
/// default on malformed input and refusing values out of range.
fn resolve(config: &Config) -> usize {
    let var = format!("{PREFIX}{}", config.name);
    println!("cargo:rerun-if-env-changed={var}");

    let Ok(raw) = env::var(&var) else {
        return config.default;
    };
    let Ok(value) = raw.trim().parse::<usize>() else {
        println!(
            "cargo:warning={var}={raw:?} is not an unsigned integer; using {}",
            config.default
        );
        return config.default;
    };
    assert!(
        config.range.contains(&value),
        "{var}={value} is out of range {:?}",
        config.range
    );
    value
}
