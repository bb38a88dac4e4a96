//! センサログを融合処理に流して，周期ごとの姿勢と較正値をCSVに書き出す
//!
//! 使い方: mag-fusion-replay <log.csv> [result.csv] [config.toml]
//!
//! 入力CSVの各行は `kind,t,x,y,z`（kind は accel / gyro / mag，t [s]，x,y,z は生カウント値）．

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mag_fusion::ellipsoid::{fit_sphere, FitBounds};
use mag_fusion::{FusionConfig, FusionContext, FusionError, Result, SensorKind, Vector3};

/// 融合周期 [s]
const TICK_PERIOD: f64 = 0.01;

/// ログの一行
struct Record {
    kind: SensorKind,
    t: f64,
    counts: [i32; 3],
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mag_fusion=info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let log_path = args.get(1).map(String::as_str).unwrap_or("./sensor_log.csv");
    let out_path = args.get(2).map(String::as_str).unwrap_or("./result_fusion.csv");
    let config = match args.get(3) {
        Some(path) => FusionConfig::load(path)?,
        None => FusionConfig::default(),
    };

    let records = load_csv(log_path)?;
    info!(path = log_path, samples = records.len(), "loaded sensor log");

    let mut ctx = FusionContext::new(config)?;
    let mut writer = BufWriter::new(File::create(out_path)?);
    writer.write_all(
        b"t,q_w,q_x,q_y,q_z,heading,roll,pitch,lock,cal_valid,V_x,V_y,V_z,W11,W22,W33,W12,W13,W23,B,calib_x,calib_y,calib_z\n",
    )?;

    let mut calibrated_samples = Vec::<Vector3>::new();
    let mut next_tick = TICK_PERIOD;
    for record in &records {
        // 周期の境界を越えたら先に融合を回す
        while record.t >= next_tick {
            tick(&mut ctx, next_tick, &mut writer, &mut calibrated_samples)?;
            next_tick += TICK_PERIOD;
        }
        let [x, y, z] = record.counts;
        ctx.push_sample(record.kind, x, y, z, Duration::from_secs_f64(record.t));
    }
    tick(&mut ctx, next_tick, &mut writer, &mut calibrated_samples)?;
    writer.flush()?;

    summarize(&ctx, &calibrated_samples);
    Ok(())
}

fn tick(
    ctx: &mut FusionContext,
    t: f64,
    writer: &mut impl Write,
    calibrated_samples: &mut Vec<Vector3>,
) -> Result<()> {
    let output = match ctx.tick(Duration::from_secs_f64(t)) {
        Ok(output) => output,
        Err(FusionError::FilterDivergence { trace }) => {
            warn!(t, trace, "filter diverged during replay");
            ctx.acknowledge_fault();
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let q = output.orientation.quaternion;
    let (roll, pitch) = ctx.filter().tilt_degrees();
    write!(
        writer,
        "{},{},{},{},{},{},{},{},{}",
        t, q.w, q.i, q.j, q.k, output.heading, roll, pitch, output.orientation.first_lock as u8
    )?;

    let cal = ctx.magnetic_calibration().calibration();
    write!(writer, ",{}", ctx.is_calibration_valid() as u8)?;
    for i in 0..3 {
        write!(writer, ",{}", cal.offset[i])?;
    }
    for i in 0..3 {  // W11, W22, W33
        write!(writer, ",{}", cal.soft_iron[(i, i)])?;
    }
    // W12, W13, W23
    write!(writer, ",{},{},{}", cal.soft_iron[(0, 1)], cal.soft_iron[(0, 2)], cal.soft_iron[(1, 2)])?;
    write!(writer, ",{}", cal.field)?;

    match output.calibrated_mag {
        Some(m) => {
            write!(writer, ",{},{},{}", m[0], m[1], m[2])?;
            calibrated_samples.push(m);
        }
        None => write!(writer, ",,,")?,
    }
    writer.write_all(b"\n")?;
    Ok(())
}

fn summarize(ctx: &FusionContext, calibrated_samples: &[Vector3]) {
    println!("--- Magnetic calibration ---");
    match ctx.get_calibration() {
        Some(cal) => {
            println!("Solver: {}-element", cal.solver.elements());
            println!("Offset: [V_x, V_y, V_z] = {:?}", <[f64; 3]>::from(cal.offset));
            println!("Field : B = {:.3} uT, fit error = {:.2} %", cal.field, cal.fit_error_pct);
        }
        None => println!("No valid calibration ({:?})", ctx.get_filter_health().last_calibration_failure),
    }

    // 較正済みデータが原点中心の球に乗っているか
    let bounds = FitBounds {
        max_condition: ctx.config().magcal.max_condition,
        max_eigen_ratio: ctx.config().magcal.max_eigen_ratio,
    };
    println!("--- Sphere fitting result(center & radius) of calibrated data ---");
    println!("The center coordinates should be close to 0.");
    match fit_sphere(calibrated_samples, &bounds) {
        Ok(fit) => println!("r = {:.4}, [X0, Y0, Z0] = {:?}", fit.field, <[f64; 3]>::from(fit.offset)),
        Err(reason) => println!("sphere fit failed: {reason}"),
    }

    let orientation = ctx.get_orientation();
    println!("--- Orientation ---");
    println!("mode = {:?}, first lock = {}", orientation.mode, orientation.first_lock);
    println!("heading = {:.1} deg", ctx.heading_degrees());
}

/// センサログを読み込む
fn load_csv(path: &str) -> Result<Vec<Record>> {
    let txt = fs::read_to_string(path)?;

    let mut records = Vec::new();
    for (n, line) in txt.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cols: Vec<&str> = line.split(',').map(str::trim).collect();
        let kind = match cols[0] {
            "accel" | "accelerometer" => SensorKind::Accelerometer,
            "gyro" | "gyroscope" => SensorKind::Gyroscope,
            "mag" | "magnetometer" => SensorKind::Magnetometer,
            // ヘッダ行
            "kind" if n == 0 => continue,
            other => return Err(FusionError::Config(format!("line {}: unknown sensor kind {other:?}", n + 1))),
        };
        if cols.len() != 5 {
            return Err(FusionError::Config(format!("line {}: expected 5 columns", n + 1)));
        }
        let parse_error = |col: &str| FusionError::Config(format!("line {}: bad value {col:?}", n + 1));
        let t: f64 = cols[1].parse().map_err(|_| parse_error(cols[1]))?;
        if !(t.is_finite() && t >= 0.0) {
            return Err(parse_error(cols[1]));
        }
        let mut counts = [0i32; 3];
        for i in 0..3 {
            counts[i] = cols[i + 2].parse().map_err(|_| parse_error(cols[i + 2]))?;
        }
        records.push(Record { kind, t, counts });
    }

    Ok(records)
}
