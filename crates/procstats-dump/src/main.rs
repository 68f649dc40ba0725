//! procstats-dump - inspects the on-disk snapshot a `procstatsd` instance
//! maintains, and (via `--reset`/`--write`) drives it over its control
//! socket. `spec.md` §6 covers this binary's CLI surface only as an
//! external-interface summary — the contract below is a faithful but
//! intentionally modest rendition of it, not a pixel-perfect port of any
//! particular host's dumper.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use clap::Parser;

use procstats_core::pool::LongPool;
use procstats_core::process::ProcessRecord;
use procstats_core::sparse::SparseStateTable;
use procstats_core::state::{ADJ_SCREEN_ON, MEM_TAGS, PROC_TAGS, STATE_COUNT};
use procstats_core::{GlobalState, Persistor, ProcessSlot};

// ── CLI ──────────────────────────────────────────────────────────────────────

/// Inspects and controls a process/package runtime statistics snapshot.
#[derive(Parser)]
#[command(name = "procstats-dump", about = "Inspect a procstats snapshot", version)]
struct Cli {
    /// Directory holding the on-disk snapshot and control socket (matches
    /// procstatsd's --data-dir).
    #[arg(short = 'd', long, default_value = "./data")]
    data_dir: PathBuf,

    /// Dump every tracked process/service, including ones with no
    /// accumulated time. Without this, idle entries are omitted.
    #[arg(short = 'a')]
    dump_all: bool,

    /// Emit the tagged checkin format instead of the human-readable dump.
    #[arg(long)]
    checkin: bool,

    /// Emit a tab-separated table instead of the human-readable dump.
    #[arg(long)]
    csv: bool,

    /// Screen dimension for --csv: comma list breaks it out into separate
    /// columns, a `+` list sums the listed values into one column.
    #[arg(long = "csv-screen")]
    csv_screen: Option<String>,

    /// Mem-factor dimension for --csv; same `,` vs `+` rule as --csv-screen.
    #[arg(long = "csv-mem")]
    csv_mem: Option<String>,

    /// Process-state dimension for --csv; same `,` vs `+` rule.
    #[arg(long = "csv-proc")]
    csv_proc: Option<String>,

    /// Ask the running procstatsd to reset its accumulator. Does not read
    /// the snapshot file.
    #[arg(long)]
    reset: bool,

    /// Ask the running procstatsd to write its current state to disk now.
    /// Does not read the snapshot file.
    #[arg(long)]
    write: bool,

    /// Restrict output to this package name.
    package: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = validate_csv_args(&cli) {
        eprintln!("argument error: {e}");
        std::process::exit(2);
    }

    let socket_path = cli.data_dir.join("control.sock");
    if cli.reset {
        run_control_command(&socket_path, "RESET");
        return;
    }
    if cli.write {
        run_control_command(&socket_path, "WRITE_SYNC");
        return;
    }

    let snapshot_path = cli.data_dir.join("current.bin");
    let state = match Persistor::load(&snapshot_path) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("failed to read snapshot at {}: {e}", snapshot_path.display());
            std::process::exit(1);
        }
    };

    let output = if cli.csv {
        match csv_dump(&cli, &state) {
            Ok(out) => out,
            Err(e) => {
                eprintln!("argument error: {e}");
                std::process::exit(2);
            }
        }
    } else if cli.checkin {
        checkin_dump(&cli, &state)
    } else {
        human_dump(&cli, &state)
    };

    print!("{output}");
}

// ── Control socket client ────────────────────────────────────────────────────

fn run_control_command(socket_path: &Path, cmd: &str) {
    match send_control_command(socket_path, cmd) {
        Ok(reply) => {
            println!("{reply}");
            if reply.starts_with("ERR") {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("failed to reach procstatsd control socket at {}: {e}", socket_path.display());
            std::process::exit(1);
        }
    }
}

fn send_control_command(socket_path: &Path, cmd: &str) -> io::Result<String> {
    let mut stream = UnixStream::connect(socket_path)?;
    writeln!(stream, "{cmd}")?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(line.trim_end().to_string())
}

// ── Argument validation ──────────────────────────────────────────────────────

fn validate_csv_args(cli: &Cli) -> Result<(), String> {
    let dims = [("--csv-screen", &cli.csv_screen), ("--csv-mem", &cli.csv_mem), ("--csv-proc", &cli.csv_proc)];
    if !cli.csv {
        if let Some((flag, _)) = dims.iter().find(|(_, v)| v.is_some()) {
            return Err(format!("{flag} requires --csv"));
        }
        return Ok(());
    }
    for (flag, list) in dims {
        if let Some(s) = list
            && s.contains(',')
            && s.contains('+')
        {
            return Err(format!("{flag} cannot mix ',' (break out) and '+' (sum) separators: {s:?}"));
        }
    }
    Ok(())
}

// ── Duration formatting ──────────────────────────────────────────────────────

fn format_duration_ms(ms: i64) -> String {
    if ms <= 0 {
        return "0s".to_string();
    }
    let mut secs = ms / 1000;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d "));
    }
    if hours > 0 || days > 0 {
        out.push_str(&format!("{hours}h "));
    }
    if mins > 0 || hours > 0 || days > 0 {
        out.push_str(&format!("{mins}m "));
    }
    out.push_str(&format!("{secs}s"));
    out
}

// ── Bucket decomposition ─────────────────────────────────────────────────────

/// Splits a composite process bucket (0..80) into its (screen_on,
/// mem_factor, proc_state) components.
fn decompose_process_bucket(bucket: u8) -> (bool, u8, u8) {
    let proc_state = bucket % STATE_COUNT;
    let adjusted = bucket / STATE_COUNT;
    let screen_on = adjusted >= ADJ_SCREEN_ON;
    let mem_factor = adjusted % ADJ_SCREEN_ON;
    (screen_on, mem_factor, proc_state)
}

fn duration_entries(pool: &LongPool, table: &SparseStateTable) -> Vec<(u8, i64)> {
    table.enumerate().map(|(tag, off)| (tag, pool.get(off, 0))).collect()
}

fn pss_entries(pool: &LongPool, table: &SparseStateTable) -> Vec<(u8, i64, i64, i64, i64)> {
    table
        .enumerate()
        .map(|(tag, off)| (tag, pool.get(off, 0), pool.get(off, 1), pool.get(off, 2), pool.get(off, 3)))
        .collect()
}

fn total_duration(pool: &LongPool, table: &SparseStateTable) -> i64 {
    duration_entries(pool, table).iter().map(|&(_, d)| d).sum()
}

// ── Row selection ─────────────────────────────────────────────────────────────

/// One (package, process name, record) triple to report on: aliases and
/// owned clones both resolve through here so every package sees its own
/// row even when it's sharing the common record.
fn selected_processes<'a>(cli: &Cli, state: &'a GlobalState) -> Vec<(&'a str, &'a str, &'a ProcessRecord)> {
    let mut rows = Vec::new();
    let mut pkg_names: Vec<&(String, u32)> = state.registry().packages.keys().collect();
    pkg_names.sort();
    for key @ (pkg_name, _uid) in pkg_names {
        if let Some(filter) = &cli.package
            && pkg_name != filter
        {
            continue;
        }
        let pkg = &state.registry().packages[key];
        let mut procs: Vec<(&String, &ProcessSlot)> = pkg.processes.iter().collect();
        procs.sort_by_key(|(name, _)| name.as_str());
        for (proc_name, slot) in procs {
            let rec = &state.arena()[slot.id()];
            if cli.dump_all || total_duration(state.pool(), &rec.durations) > 0 {
                rows.push((pkg_name.as_str(), proc_name.as_str(), rec));
            }
        }
    }
    rows
}

// ── Human dump ────────────────────────────────────────────────────────────────

fn human_dump(cli: &Cli, state: &GlobalState) -> String {
    let mut out = String::new();
    let mut pkg_names: Vec<&(String, u32)> = state.registry().packages.keys().collect();
    pkg_names.sort();

    for key @ (pkg_name, uid) in pkg_names {
        if let Some(filter) = &cli.package
            && pkg_name != filter
        {
            continue;
        }
        let pkg = &state.registry().packages[key];
        let mut procs: Vec<(&String, &ProcessSlot)> = pkg.processes.iter().collect();
        procs.sort_by_key(|(name, _)| name.as_str());
        let mut svcs: Vec<(&String, &procstats_core::ServiceRecord)> = pkg.services.iter().collect();
        svcs.sort_by_key(|(name, _)| name.as_str());

        out.push_str(&format!("* {pkg_name} / uid {uid}\n"));
        for (proc_name, slot) in procs {
            let rec = &state.arena()[slot.id()];
            let total = total_duration(state.pool(), &rec.durations);
            if !cli.dump_all && total == 0 {
                continue;
            }
            let alias_note = match slot {
                ProcessSlot::Alias(_) => " (shared)",
                ProcessSlot::Own(_) => "",
            };
            out.push_str(&format!("    PROC {proc_name}{alias_note} total={}\n", format_duration_ms(total)));
            for (bucket, dur) in duration_entries(state.pool(), &rec.durations) {
                let (screen_on, mem, proc_state) = decompose_process_bucket(bucket);
                out.push_str(&format!(
                    "        {} {} {} = {}\n",
                    if screen_on { "screen-on" } else { "screen-off" },
                    MEM_TAGS.get(mem as usize).copied().unwrap_or('?'),
                    PROC_TAGS.get(proc_state as usize).copied().unwrap_or('?'),
                    format_duration_ms(dur)
                ));
            }
            for (bucket, count, min, avg, max) in pss_entries(state.pool(), &rec.pss) {
                let (screen_on, mem, proc_state) = decompose_process_bucket(bucket);
                out.push_str(&format!(
                    "        pss {} {} {} min={min}k avg={avg}k max={max}k n={count}\n",
                    if screen_on { "screen-on" } else { "screen-off" },
                    MEM_TAGS.get(mem as usize).copied().unwrap_or('?'),
                    PROC_TAGS.get(proc_state as usize).copied().unwrap_or('?'),
                ));
            }
            if rec.excessive_wake_count > 0 || rec.excessive_cpu_count > 0 {
                out.push_str(&format!(
                    "        excessive: wake={} cpu={}\n",
                    rec.excessive_wake_count, rec.excessive_cpu_count
                ));
            }
        }
        for (svc_name, svc) in svcs {
            let total = svc.started.durations.iter().sum::<i64>()
                + svc.bound.durations.iter().sum::<i64>()
                + svc.executing.durations.iter().sum::<i64>();
            if !cli.dump_all && total == 0 {
                continue;
            }
            out.push_str(&format!(
                "    SVC {svc_name} started={} bound={} executing={}\n",
                format_duration_ms(svc.started.durations.iter().sum()),
                format_duration_ms(svc.bound.durations.iter().sum()),
                format_duration_ms(svc.executing.durations.iter().sum()),
            ));
        }
    }

    out.push_str("\nmem-factor run time:\n");
    for (adjusted, dur) in state.mem_factor_durations().iter().enumerate() {
        if *dur == 0 && !cli.dump_all {
            continue;
        }
        let screen_on = adjusted as u8 >= ADJ_SCREEN_ON;
        let mem = adjusted as u8 % ADJ_SCREEN_ON;
        out.push_str(&format!(
            "    {} {} = {}\n",
            if screen_on { "screen-on" } else { "screen-off" },
            MEM_TAGS.get(mem as usize).copied().unwrap_or('?'),
            format_duration_ms(*dur)
        ));
    }

    out
}

// ── Checkin dump ──────────────────────────────────────────────────────────────

fn tag(screen_on: bool, mem: u8, proc_state: Option<u8>) -> String {
    let screen_c = if screen_on { '1' } else { '0' };
    let mem_c = MEM_TAGS.get(mem as usize).copied().unwrap_or('?');
    match proc_state {
        Some(p) => format!("{screen_c}{mem_c}{}", PROC_TAGS.get(p as usize).copied().unwrap_or('?')),
        None => format!("{screen_c}{mem_c}"),
    }
}

fn checkin_dump(cli: &Cli, state: &GlobalState) -> String {
    let mut out = String::new();
    out.push_str("vers,1\n");

    for (pkg_name, proc_name, rec) in selected_processes(cli, state) {
        let mut fields = format!("pkgproc,{pkg_name},{},{proc_name}", rec.uid);
        for (bucket, dur) in duration_entries(state.pool(), &rec.durations) {
            let (screen_on, mem, proc_state) = decompose_process_bucket(bucket);
            fields.push_str(&format!(",{}:{dur}", tag(screen_on, mem, Some(proc_state))));
        }
        out.push_str(&fields);
        out.push('\n');

        if !rec.pss.is_empty() {
            let mut pss_line = format!("pkgpss,{pkg_name},{},{proc_name}", rec.uid);
            for (bucket, count, min, avg, max) in pss_entries(state.pool(), &rec.pss) {
                let (screen_on, mem, proc_state) = decompose_process_bucket(bucket);
                let t = tag(screen_on, mem, Some(proc_state));
                pss_line.push_str(&format!(",{t}:{count}:{min}:{avg}:{max}"));
            }
            out.push_str(&pss_line);
            out.push('\n');
        }

        if rec.excessive_wake_count > 0 || rec.excessive_cpu_count > 0 {
            out.push_str(&format!(
                "pkgkills,{pkg_name},{},{proc_name},wake:{},cpu:{}\n",
                rec.uid, rec.excessive_wake_count, rec.excessive_cpu_count
            ));
        }
    }

    let mut pkg_names: Vec<&(String, u32)> = state.registry().packages.keys().collect();
    pkg_names.sort();
    for key @ (pkg_name, uid) in pkg_names {
        if let Some(filter) = &cli.package
            && pkg_name != filter
        {
            continue;
        }
        let pkg = &state.registry().packages[key];
        let mut svcs: Vec<(&String, &procstats_core::ServiceRecord)> = pkg.services.iter().collect();
        svcs.sort_by_key(|(name, _)| name.as_str());
        for (svc_name, svc) in svcs {
            for (kind, mode) in [("pkgsvc-start", &svc.started), ("pkgsvc-bound", &svc.bound), ("pkgsvc-exec", &svc.executing)] {
                if !cli.dump_all && mode.durations.iter().all(|&d| d == 0) && mode.op_count == 0 {
                    continue;
                }
                let mut line = format!("{kind},{pkg_name},{uid},{svc_name},ops:{}", mode.op_count);
                for (adjusted, dur) in mode.durations.iter().enumerate() {
                    let screen_on = adjusted as u8 >= ADJ_SCREEN_ON;
                    let mem = adjusted as u8 % ADJ_SCREEN_ON;
                    line.push_str(&format!(",{}:{dur}", tag(screen_on, mem, None)));
                }
                out.push_str(&line);
                out.push('\n');
            }
        }
    }

    out
}

// ── CSV dump ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum DimSpec {
    /// One column per listed value.
    Separate(Vec<u8>),
    /// One column summing all listed values.
    Summed(Vec<u8>),
}

fn parse_dim(raw: Option<&str>, valid: &[char]) -> Result<DimSpec, String> {
    let Some(s) = raw else {
        return Ok(DimSpec::Summed((0..valid.len() as u8).collect()));
    };
    let sep = if s.contains('+') { '+' } else { ',' };
    let mut tokens = Vec::new();
    for part in s.split(sep) {
        let part = part.trim();
        let c = part.chars().next().ok_or_else(|| format!("empty token in list {s:?}"))?;
        let idx = valid
            .iter()
            .position(|&v| v == c)
            .ok_or_else(|| format!("unknown tag {c:?} in list {s:?}"))?;
        tokens.push(idx as u8);
    }
    if sep == '+' {
        Ok(DimSpec::Summed(tokens))
    } else {
        Ok(DimSpec::Separate(tokens))
    }
}

fn dim_groups(spec: &DimSpec) -> Vec<Vec<u8>> {
    match spec {
        DimSpec::Separate(vals) => vals.iter().map(|&v| vec![v]).collect(),
        DimSpec::Summed(vals) => vec![vals.clone()],
    }
}

fn group_label(values: &[u8], tags: &[char]) -> String {
    if values.len() == tags.len() {
        "all".to_string()
    } else {
        values.iter().map(|&v| tags.get(v as usize).copied().unwrap_or('?')).collect()
    }
}

fn csv_dump(cli: &Cli, state: &GlobalState) -> Result<String, String> {
    let screen_spec = parse_dim(cli.csv_screen.as_deref(), &['0', '1'])?;
    let mem_spec = parse_dim(cli.csv_mem.as_deref(), &MEM_TAGS)?;
    let proc_spec = parse_dim(cli.csv_proc.as_deref(), &PROC_TAGS)?;

    let screen_groups = dim_groups(&screen_spec);
    let mem_groups = dim_groups(&mem_spec);
    let proc_groups = dim_groups(&proc_spec);

    let mut columns: Vec<(String, Vec<u8>, Vec<u8>, Vec<u8>)> = Vec::new();
    for screens in &screen_groups {
        for mems in &mem_groups {
            for procs in &proc_groups {
                let label = format!(
                    "{}_{}_{}",
                    group_label(screens, &['0', '1']),
                    group_label(mems, &MEM_TAGS),
                    group_label(procs, &PROC_TAGS),
                );
                columns.push((label, screens.clone(), mems.clone(), procs.clone()));
            }
        }
    }

    let mut out = String::new();
    out.push_str("pkg\tuid\tproc");
    for (label, ..) in &columns {
        out.push('\t');
        out.push_str(label);
    }
    out.push('\n');

    for (pkg_name, proc_name, rec) in selected_processes(cli, state) {
        out.push_str(&format!("{pkg_name}\t{}\t{proc_name}", rec.uid));
        for (_, screens, mems, procs) in &columns {
            let mut sum = 0i64;
            for &screen_on in screens {
                for &mem in mems {
                    for &proc_state in procs {
                        let adjusted = mem + if screen_on == 1 { ADJ_SCREEN_ON } else { 0 };
                        let bucket = proc_state + adjusted * STATE_COUNT;
                        if let Some(off) = rec.durations.get(bucket) {
                            sum += state.pool().get(off, 0);
                        }
                    }
                }
            }
            out.push('\t');
            out.push_str(&sum.to_string());
        }
        out.push('\n');
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_duration_renders_components() {
        assert_eq!(format_duration_ms(0), "0s");
        assert_eq!(format_duration_ms(1_000), "1s");
        assert_eq!(format_duration_ms(61_000), "1m 1s");
        assert_eq!(format_duration_ms(3_661_000), "1h 1m 1s");
        assert_eq!(format_duration_ms(90_061_000), "1d 1h 1m 1s");
    }

    #[test]
    fn decompose_process_bucket_matches_composite_bucket_formula() {
        assert_eq!(decompose_process_bucket(1), (false, 0, 1));
        assert_eq!(decompose_process_bucket(79), (true, 3, 9));
    }

    #[test]
    fn mixing_comma_and_plus_is_rejected() {
        let cli = Cli {
            data_dir: PathBuf::from("."),
            dump_all: false,
            checkin: false,
            csv: true,
            csv_screen: Some("0,1+0".to_string()),
            csv_mem: None,
            csv_proc: None,
            reset: false,
            write: false,
            package: None,
        };
        assert!(validate_csv_args(&cli).is_err());
    }

    #[test]
    fn csv_dims_require_csv_flag() {
        let cli = Cli {
            data_dir: PathBuf::from("."),
            dump_all: false,
            checkin: false,
            csv: false,
            csv_screen: Some("0,1".to_string()),
            csv_mem: None,
            csv_proc: None,
            reset: false,
            write: false,
            package: None,
        };
        assert!(validate_csv_args(&cli).is_err());
    }

    #[test]
    fn parse_dim_defaults_to_one_summed_group_over_every_value() {
        let spec = parse_dim(None, &['0', '1']).unwrap();
        assert_eq!(dim_groups(&spec), vec![vec![0, 1]]);
    }

    #[test]
    fn parse_dim_comma_breaks_out_separate_groups() {
        let spec = parse_dim(Some("0,1"), &['0', '1']).unwrap();
        assert_eq!(dim_groups(&spec), vec![vec![0], vec![1]]);
    }

    #[test]
    fn human_dump_reports_a_populated_process() {
        let mut gs = GlobalState::new(0);
        gs.set_mem_factor(0, 0);
        gs.get_process("p1", 1000, "com.x", 0);
        gs.set_process_state("p1", 1000, "com.x", Some(1), 1000);
        gs.commit_all(1000);

        let cli = Cli {
            data_dir: PathBuf::from("."),
            dump_all: false,
            checkin: false,
            csv: false,
            csv_screen: None,
            csv_mem: None,
            csv_proc: None,
            reset: false,
            write: false,
            package: None,
        };
        let out = human_dump(&cli, &gs);
        assert!(out.contains("p1 / uid 1000"));
        assert!(out.contains("PROC com.x"));
    }

    #[test]
    fn checkin_dump_starts_with_a_version_line() {
        let gs = GlobalState::new(0);
        let cli = Cli {
            data_dir: PathBuf::from("."),
            dump_all: false,
            checkin: true,
            csv: false,
            csv_screen: None,
            csv_mem: None,
            csv_proc: None,
            reset: false,
            write: false,
            package: None,
        };
        assert!(checkin_dump(&cli, &gs).starts_with("vers,1\n"));
    }
}
