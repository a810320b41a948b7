/// The radio scans faster, so the AP table has to tolerate more channel switches between beacons.
const FAST_SCAN: &str = "fast_scan";
/// The firmware settings have room for the three extra connection slots.
const EXTENDED_PROFILES: &str = "extended_profiles";

const NTR_META: &[&str] = &[];
const TWL_META: &[&str] = &[FAST_SCAN, EXTENDED_PROFILES];

fn main() {
    println!("cargo::rustc-check-cfg=cfg({FAST_SCAN})");
    println!("cargo::rustc-check-cfg=cfg({EXTENDED_PROFILES})");
    let feature = |name: &str| std::env::var_os(format!("CARGO_FEATURE_{name}")).is_some();
    let meta = match (feature("NTR"), feature("TWL")) {
        // `twl` wins over the default feature, so `--features twl` works without
        // `--no-default-features`.
        (_, true) => TWL_META,
        (true, false) => NTR_META,
        (false, false) => panic!("You must select exactly one radio variant."),
    };
    for item in meta {
        println!("cargo:rustc-cfg={item}");
    }
}
