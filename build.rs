//! Generates the pool size-class table at compile time.
//!
//! Driven by `poolclasses.toml` (or the path in the `VMALLOC_POOL_CLASSES`
//! env var): a linear run of 8-byte classes from 8 to 128 bytes, followed by
//! `bins_per_octave` geometrically-spaced classes per power of two up to
//! `max_class`. Each class also gets a 32-bit fixed-point reciprocal of its
//! size so `pool::Pool` can turn a byte offset into a block index without a
//! division instruction on the free/alloc hot path.

use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    /// Largest pool size class, in bytes. Must be a power of two.
    max_class: usize,
    /// Bins per power-of-two octave above `linear_ceiling`.
    bins_per_octave: usize,
    /// Linear 8-byte-spaced classes run from 8 up to and including this size.
    linear_ceiling: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_class: 4 * 1024 * 1024,
            bins_per_octave: 4,
            linear_ceiling: 128,
        }
    }
}

struct Class {
    size: usize,
    /// `ceil(2^32 / size)`: for block index `k`, `(k * size * recip) >> 32 == k`.
    recip: u32,
}

fn recip_of(size: usize) -> u32 {
    let size = size as u64;
    (1u64 << 32).div_ceil(size).min(u32::MAX as u64) as u32
}

fn generate_classes(cfg: &Config) -> Vec<Class> {
    assert!(cfg.max_class.is_power_of_two(), "max_class must be a power of two");
    assert!(
        cfg.linear_ceiling.is_power_of_two(),
        "linear_ceiling must be a power of two"
    );
    assert!(cfg.bins_per_octave > 0, "bins_per_octave must be > 0");

    let mut sizes = Vec::new();

    // Linear run: 8, 16, 24, ..., linear_ceiling (8-byte spacing).
    let mut s = 8;
    while s <= cfg.linear_ceiling {
        sizes.push(s);
        s += 8;
    }

    // Geometric run: `bins_per_octave` classes per doubling, spaced linearly
    // within each octave so the largest class in an octave is the power of
    // two itself. Bounds internal fragmentation to ~1/bins_per_octave.
    let mut power = cfg.linear_ceiling;
    while power < cfg.max_class {
        let step = power / cfg.bins_per_octave;
        for i in 1..=cfg.bins_per_octave {
            sizes.push(power + step * i);
        }
        power *= 2;
    }

    sizes
        .into_iter()
        .map(|size| Class { size, recip: recip_of(size) })
        .collect()
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{manifest_dir}/poolclasses.toml")
}

fn generate_code(classes: &[Class]) -> String {
    let mut code = String::from("// Auto-generated by build.rs. Do not edit.\n\n");

    code.push_str(&format!("pub const NUM_POOL_CLASSES: usize = {};\n\n", classes.len() + 1));
    code.push_str(&format!(
        "pub static POOL_CLASSES: [PoolClassInfo; {}] = [\n",
        classes.len() + 1
    ));
    code.push_str("    PoolClassInfo { size: 0, recip: 0 }, // sentinel\n");
    for c in classes {
        code.push_str(&format!(
            "    PoolClassInfo {{ size: {}, recip: {} }},\n",
            c.size, c.recip
        ));
    }
    code.push_str("];\n");
    code
}

fn main() {
    println!("cargo:rerun-if-env-changed=VMALLOC_POOL_CLASSES");

    let out_dir = env::var("OUT_DIR").unwrap();
    let config_path = env::var("VMALLOC_POOL_CLASSES").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={config_path}");

    let cfg = match fs::read_to_string(&config_path) {
        Ok(content) => {
            toml::from_str(&content).expect("failed to parse pool class config")
        }
        Err(_) => Config::default(),
    };

    let classes = generate_classes(&cfg);
    assert!(classes.len() < 256, "too many pool classes ({})", classes.len());

    let code = generate_code(&classes);
    fs::write(Path::new(&out_dir).join("pool_class_gen.rs"), code)
        .expect("failed to write pool_class_gen.rs");
}
