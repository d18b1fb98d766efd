use std::env;
use std::process;

use ndarray_multirate::config::RunConfig;
use ndarray_multirate::harness::{table_header, Harness};
use ndarray_multirate::multirate::method_names;

fn print_help() {
    println!("Multirate adaptive integration of the coupled KPR test system");
    println!();
    println!("Options (--key value):");
    println!("  --e X            coupling strength (default 0.5)");
    println!("  --G X            slow stiffness, negative (default -100)");
    println!("  --w X            time-scale separation, >= 1 (default 100)");
    println!("  --hs X           slow step: fixed step when scontrol = 0,");
    println!("                   initial step otherwise (default 0.01)");
    println!("  --hf X           fast step when fcontrol = 0 (default 1e-4)");
    println!("  --set_h0 0|1     seed adaptive runs with hs/hf (default 0)");
    println!("  --rtol X         slow relative tolerance (default 1e-4)");
    println!("  --atol X         absolute tolerance (default 1e-11)");
    println!("  --fast_rtol X    fast relative tolerance (default 1e-4)");
    println!("  --method NAME    slow method (default erk45);");
    println!("                   known: {}", method_names().join(", "));
    println!("  --fast_order N   fast method order, 0 disables the fast");
    println!("                   scale (default 4; one of 0, 2, 3, 4, 5)");
    println!("  --scontrol N     slow controller: 0 fixed, 5..24 the");
    println!("                   paired/standalone family grid (default 6)");
    println!("  --fcontrol N     fast controller: 0 fixed, 1..10 the");
    println!("                   families (default 1)");
    println!("  --faccum N       fast error accumulation: -1 none, 0 max,");
    println!("                   1 sum, 2 average (default 0)");
    println!("  --slow_pq 0|1    use the slow method order in controller");
    println!("                   exponents (default 0)");
    println!("  --fast_pq 0|1    same for the fast method (default 0)");
    println!("  --k1s/--k2s/--k3s X   slow controller gains (-1 = default)");
    println!("  --k1f/--k2f/--k3f X   fast controller gains (-1 = default)");
    println!("  --bias X         controller error bias (-1 = default)");
    println!("  --safety X       slow step safety factor (-1 = default)");
    println!("  --htol_relch X   H/Tol relative-change cap (-1 = default)");
    println!("  --htol_minfac X  H/Tol factor lower bound (-1 = default)");
    println!("  --htol_maxfac X  H/Tol factor upper bound (-1 = default)");
    println!("  --help           print this text and exit");
}

fn parse_f64(key: &str, value: &str) -> Result<f64, String> {
    value
        .parse()
        .map_err(|_| format!("{}: expected a number, got '{}'", key, value))
}

fn parse_i32(key: &str, value: &str) -> Result<i32, String> {
    value
        .parse()
        .map_err(|_| format!("{}: expected an integer, got '{}'", key, value))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, String> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(format!("{}: expected 0 or 1, got '{}'", key, other)),
    }
}

fn parse_args() -> Result<RunConfig, String> {
    let mut cfg = RunConfig::default();
    let mut args = env::args().skip(1);
    while let Some(key) = args.next() {
        if key == "--help" {
            print_help();
            process::exit(0);
        }
        let value = args
            .next()
            .ok_or_else(|| format!("missing value for {}", key))?;
        match key.as_str() {
            "--e" => cfg.coupling = parse_f64(&key, &value)?,
            "--G" => cfg.stiffness = parse_f64(&key, &value)?,
            "--w" => cfg.separation = parse_f64(&key, &value)?,
            "--hs" => cfg.hs = parse_f64(&key, &value)?,
            "--hf" => cfg.hf = parse_f64(&key, &value)?,
            "--set_h0" => cfg.set_h0 = parse_flag(&key, &value)?,
            "--rtol" => cfg.rtol = parse_f64(&key, &value)?,
            "--atol" => cfg.atol = parse_f64(&key, &value)?,
            "--fast_rtol" => cfg.fast_rtol = parse_f64(&key, &value)?,
            "--method" => cfg.method = value,
            "--fast_order" => {
                let n = parse_i32(&key, &value)?;
                if n < 0 {
                    return Err(format!("{}: must be non-negative", key));
                }
                cfg.fast_order = n as usize;
            }
            "--scontrol" => cfg.scontrol = parse_i32(&key, &value)?,
            "--fcontrol" => cfg.fcontrol = parse_i32(&key, &value)?,
            "--faccum" => cfg.faccum = parse_i32(&key, &value)?,
            "--slow_pq" => cfg.slow_pq = parse_flag(&key, &value)?,
            "--fast_pq" => cfg.fast_pq = parse_flag(&key, &value)?,
            "--k1s" => cfg.slow_gains[0] = parse_f64(&key, &value)?,
            "--k2s" => cfg.slow_gains[1] = parse_f64(&key, &value)?,
            "--k3s" => cfg.slow_gains[2] = parse_f64(&key, &value)?,
            "--k1f" => cfg.fast_gains[0] = parse_f64(&key, &value)?,
            "--k2f" => cfg.fast_gains[1] = parse_f64(&key, &value)?,
            "--k3f" => cfg.fast_gains[2] = parse_f64(&key, &value)?,
            "--bias" => cfg.bias = parse_f64(&key, &value)?,
            "--safety" => cfg.safety = parse_f64(&key, &value)?,
            "--htol_relch" => cfg.htol_relch = parse_f64(&key, &value)?,
            "--htol_minfac" => cfg.htol_minfac = parse_f64(&key, &value)?,
            "--htol_maxfac" => cfg.htol_maxfac = parse_f64(&key, &value)?,
            other => return Err(format!("unknown option {}", other)),
        }
    }
    Ok(cfg)
}

fn main() {
    env_logger::init();

    let cfg = match parse_args() {
        Ok(cfg) => cfg,
        Err(msg) => {
            eprintln!("error: {}", msg);
            eprintln!("run with --help for the option list");
            process::exit(1);
        }
    };

    let mut harness = match Harness::from_config(cfg) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };

    let cfg = harness.config();
    println!("Multirate coupled KPR test problem:");
    println!(
        "  e = {}, G = {}, w = {}",
        cfg.coupling, cfg.stiffness, cfg.separation
    );
    println!(
        "  method = {}, fast order = {}, scontrol = {}, fcontrol = {}",
        cfg.method, cfg.fast_order, cfg.scontrol, cfg.fcontrol
    );
    println!(
        "  rtol = {:e}, atol = {:e}, fast rtol = {:e}",
        cfg.rtol, cfg.atol, cfg.fast_rtol
    );
    println!();
    println!("{}", table_header());

    match harness.run(|row| println!("{}", row)) {
        Ok(summary) => {
            println!();
            println!("{}", summary);
        }
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}
