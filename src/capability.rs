//! Host CPU capability detection.
//!
//! Produces the set of instruction-set capabilities the running host
//! supports, minus anything the operator disabled through
//! [`DISABLE_ENV`]. Detection never fails: every error path (missing
//! pseudo-file, subprocess failure, unsupported platform) degrades to
//! "capability absent" with the detail emitted on the tracing side channel.
//!
//! The primary path uses the standard library's runtime feature queries.
//! Targets without them fall back to legacy platform probes: `sysctl` on
//! macOS, `/proc/cpuinfo` on Linux, the empty set everywhere else. Arm SVE
//! is not covered by the runtime queries here and is detected separately by
//! scanning the `Features` line of `/proc/cpuinfo`.

use std::collections::BTreeSet;
use std::env;
use std::path::Path;

/// Environment variable listing capability names to force-disable.
///
/// Names are separated by any of `,`, space, tab, newline, or carriage
/// return; empty tokens are ignored. Matching is exact: disabling `AVX`
/// does not disable `AVX2`.
pub const DISABLE_ENV: &str = "NEXT_MAXSIM_DISABLE_CPU_FEATURES";

const DISABLE_DELIMITERS: [char; 5] = [',', ' ', '\t', '\n', '\r'];

/// Detected capability tokens, uppercase, after operator overrides.
pub type CapabilitySet = BTreeSet<String>;

/// Detect the host's effective capability set.
///
/// Combines the generic feature flags with the independent SVE probe, then
/// removes every name listed in [`DISABLE_ENV`].
pub fn supported_instruction_sets() -> CapabilitySet {
    let mut caps = detect_features();
    if sve_supported() {
        caps.insert("SVE".to_string());
    }
    apply_disable_list(&mut caps, &env::var(DISABLE_ENV).unwrap_or_default());
    caps
}

/// Split an operator disable list into capability names.
///
/// Consecutive delimiters produce no tokens.
pub fn parse_disable_list(raw: &str) -> Vec<String> {
    raw.split(DISABLE_DELIMITERS)
        .filter(|tok| !tok.is_empty())
        .map(str::to_string)
        .collect()
}

/// Remove every exact-match name in `raw` from `caps`.
pub fn apply_disable_list(caps: &mut CapabilitySet, raw: &str) {
    for tok in parse_disable_list(raw) {
        if caps.remove(&tok) {
            tracing::debug!("capability {tok} disabled by operator override");
        }
    }
}

/// Generic capability detection, without the SVE probe and without
/// operator overrides.
pub fn detect_features() -> CapabilitySet {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        x86_features()
    }
    #[cfg(target_arch = "aarch64")]
    {
        aarch64_features()
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
    {
        legacy_features()
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn x86_features() -> CapabilitySet {
    let mut caps = CapabilitySet::new();
    macro_rules! probe {
        ($feature:tt => $name:expr) => {
            if is_x86_feature_detected!($feature) {
                caps.insert($name.to_string());
            }
        };
    }
    probe!("sse2" => "SSE2");
    probe!("sse3" => "SSE3");
    probe!("ssse3" => "SSSE3");
    probe!("sse4.1" => "SSE41");
    probe!("sse4.2" => "SSE42");
    probe!("popcnt" => "POPCNT");
    probe!("avx" => "AVX");
    probe!("f16c" => "F16C");
    probe!("fma" => "FMA3");
    probe!("avx2" => "AVX2");
    probe!("avx512f" => "AVX512F");
    probe!("avx512bw" => "AVX512BW");
    probe!("avx512vl" => "AVX512VL");
    caps
}

#[cfg(target_arch = "aarch64")]
fn aarch64_features() -> CapabilitySet {
    let mut caps = CapabilitySet::new();
    macro_rules! probe {
        ($feature:tt => $name:expr) => {
            if std::arch::is_aarch64_feature_detected!($feature) {
                caps.insert($name.to_string());
            }
        };
    }
    // SVE is deliberately not probed here; see `sve_supported`.
    probe!("neon" => "NEON");
    probe!("aes" => "AES");
    probe!("sha2" => "SHA2");
    probe!("crc" => "CRC32");
    probe!("dotprod" => "ASIMDDP");
    probe!("fp16" => "ASIMDHP");
    caps
}

/// Legacy probes for targets without standard runtime feature queries.
/// At most the single wide-vector capability is reported.
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn legacy_features() -> CapabilitySet {
    let mut caps = CapabilitySet::new();
    let avx2 = if cfg!(target_os = "macos") {
        sysctl_reports_avx2()
    } else if cfg!(target_os = "linux") {
        match std::fs::read_to_string("/proc/cpuinfo") {
            Ok(text) => cpuinfo_has_flag(&text, "avx2"),
            Err(e) => {
                tracing::debug!("could not read /proc/cpuinfo: {e}");
                false
            }
        }
    } else {
        false
    };
    if avx2 {
        caps.insert("AVX2".to_string());
    }
    caps
}

/// Query `sysctl hw.optional.avx2_0` synchronously. Any failure reads as
/// unsupported.
#[allow(dead_code)]
fn sysctl_reports_avx2() -> bool {
    let output = match std::process::Command::new("/usr/sbin/sysctl")
        .arg("hw.optional.avx2_0")
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!("sysctl invocation failed: {e}");
            return false;
        }
    };
    if !output.status.success() {
        tracing::debug!("sysctl exited with {}", output.status);
        return false;
    }
    match String::from_utf8(output.stdout) {
        Ok(text) => parse_sysctl_flag(&text),
        Err(e) => {
            tracing::debug!("sysctl output was not UTF-8: {e}");
            false
        }
    }
}

/// Parse `key: value` sysctl output; true iff the value is `1`.
fn parse_sysctl_flag(output: &str) -> bool {
    output
        .split_once(':')
        .map(|(_, value)| value.trim() == "1")
        .unwrap_or(false)
}

/// Substring check against the first `flags` line of cpuinfo text.
#[allow(dead_code)]
fn cpuinfo_has_flag(text: &str, flag: &str) -> bool {
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim() == "flags" {
                return value.contains(flag);
            }
        }
    }
    false
}

/// Exact-token check against the whitespace-separated `Features` values of
/// cpuinfo text. Any `Features` line may match.
fn cpuinfo_features_has_token(text: &str, token: &str) -> bool {
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim() == "Features" && value.split_whitespace().any(|t| t == token) {
                return true;
            }
        }
    }
    false
}

/// Whether the host supports the Arm Scalable Vector Extension.
///
/// Only aarch64 Linux can report true, and only when `/proc/cpuinfo` lists
/// the `sve` token on a `Features` line. Every failure mode is "not
/// supported", never an error.
pub fn sve_supported() -> bool {
    sve_supported_on(env::consts::ARCH, env::consts::OS, Path::new("/proc/cpuinfo"))
}

fn sve_supported_on(machine: &str, system: &str, cpuinfo: &Path) -> bool {
    if machine != "aarch64" {
        return false;
    }
    if system != "linux" {
        return false;
    }
    let text = match std::fs::read_to_string(cpuinfo) {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!("could not read {}: {e}", cpuinfo.display());
            return false;
        }
    };
    cpuinfo_features_has_token(&text, "sve")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn caps(names: &[&str]) -> CapabilitySet {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_parse_disable_list_each_delimiter() {
        for raw in ["AVX2,SVE", "AVX2 SVE", "AVX2\tSVE", "AVX2\nSVE", "AVX2\rSVE"] {
            assert_eq!(parse_disable_list(raw), vec!["AVX2", "SVE"], "raw = {raw:?}");
        }
    }

    #[test]
    fn test_parse_disable_list_ignores_empty_tokens() {
        assert_eq!(parse_disable_list(",, AVX2 ,\t\n, SVE ,,"), vec!["AVX2", "SVE"]);
        assert!(parse_disable_list("").is_empty());
        assert!(parse_disable_list(", \t\n\r").is_empty());
    }

    #[test]
    fn test_apply_disable_list_removes_exact_matches() {
        let mut detected = caps(&["AVX2", "SVE", "NEON"]);
        apply_disable_list(&mut detected, "AVX2, SVE");
        assert_eq!(detected, caps(&["NEON"]));
    }

    #[test]
    fn test_apply_disable_list_is_exact_match_only() {
        let mut detected = caps(&["AVX2", "AVX512F"]);
        apply_disable_list(&mut detected, "AVX AVX512");
        assert_eq!(detected, caps(&["AVX2", "AVX512F"]));
    }

    #[test]
    fn test_apply_disable_list_unknown_names_are_noops() {
        let mut detected = caps(&["NEON"]);
        apply_disable_list(&mut detected, "AVX2,SVE,VSX");
        assert_eq!(detected, caps(&["NEON"]));
    }

    #[test]
    fn test_parse_sysctl_flag() {
        assert!(parse_sysctl_flag("hw.optional.avx2_0: 1\n"));
        assert!(!parse_sysctl_flag("hw.optional.avx2_0: 0\n"));
        assert!(!parse_sysctl_flag("hw.optional.avx2_0 = 1"));
        assert!(!parse_sysctl_flag(""));
    }

    #[test]
    fn test_cpuinfo_has_flag_uses_first_flags_line() {
        let text = "processor\t: 0\nflags\t\t: fpu sse sse2\nprocessor\t: 1\nflags\t\t: fpu avx2\n";
        assert!(!cpuinfo_has_flag(text, "avx2"));
        assert!(cpuinfo_has_flag(text, "sse2"));
        assert!(!cpuinfo_has_flag("model name\t: Foo\n", "avx2"));
    }

    #[test]
    fn test_cpuinfo_features_token_match_is_exact() {
        let text = "processor\t: 0\nFeatures\t: fp asimd sve2\n";
        assert!(!cpuinfo_features_has_token(text, "sve"));
        assert!(cpuinfo_features_has_token(text, "sve2"));

        let text = "Features\t: fp asimd sve asimddp\n";
        assert!(cpuinfo_features_has_token(text, "sve"));
    }

    fn write_cpuinfo(dir: &TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("cpuinfo");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_sve_requires_aarch64() {
        let dir = TempDir::new().unwrap();
        let cpuinfo = write_cpuinfo(&dir, "Features\t: fp asimd sve\n");
        assert!(!sve_supported_on("x86_64", "linux", &cpuinfo));
    }

    #[test]
    fn test_sve_requires_linux() {
        let dir = TempDir::new().unwrap();
        let cpuinfo = write_cpuinfo(&dir, "Features\t: fp asimd sve\n");
        assert!(!sve_supported_on("aarch64", "macos", &cpuinfo));
    }

    #[test]
    fn test_sve_requires_readable_cpuinfo() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("no-such-file");
        assert!(!sve_supported_on("aarch64", "linux", &missing));
    }

    #[test]
    fn test_sve_detected_from_features_line() {
        let dir = TempDir::new().unwrap();
        let with_sve = write_cpuinfo(&dir, "processor\t: 0\nFeatures\t: fp asimd sve\n");
        assert!(sve_supported_on("aarch64", "linux", &with_sve));

        let without_sve = write_cpuinfo(&dir, "processor\t: 0\nFeatures\t: fp asimd\n");
        assert!(!sve_supported_on("aarch64", "linux", &without_sve));
    }
}
