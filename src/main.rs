use anyhow::{bail, Context};
use buffer_sorter::{HostEmulator, HostTransfer, SortOptions, Sorter, WgpuBackend, WgpuBackendConfig};
use clap::{Parser, ValueEnum};
use fern::colors::ColoredLevelConfig;
use log::{debug, error, info};
use rand::{rngs::StdRng, Rng, SeedableRng};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Gpu,
    Host,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Sorts random buffers on the device and checks them against a host sort.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Arguments {
    #[arg(long, help("first element count tested"), default_value_t = 10)]
    start_count: usize,
    #[arg(long, help("element count the tests stop before"), default_value_t = 100)]
    end_count: usize,
    #[arg(short, long, help("random buffers sorted per count and settings"), default_value_t = 5)]
    runs_per_count: usize,
    #[arg(long, help("values are drawn below this bound (and above its opposite with negatives)"), default_value_t = 100)]
    random_range: i32,
    #[arg(short, long, help("length used by the settings sorting only the first elements"), default_value_t = 20)]
    first_n: usize,
    #[arg(short, long, value_enum, default_value_t = Backend::Gpu)]
    backend: Backend,
    #[arg(short, long, help("sort values through a separate key buffer"))]
    keyed: bool,
    #[arg(short, long, help("log GPU timings of every stage"))]
    profile: bool,
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
    #[arg(short, long, help("seed of the random buffers, drawn from entropy when missing"))]
    seed: Option<u64>,
}

impl Arguments {
    fn parse_and_validate() -> Self {
        let args = Self::parse();
        assert!(args.start_count > 0, "start count must be > 0.");
        assert!(args.start_count < args.end_count, "start count must be below end count.");
        assert!(args.runs_per_count > 0, "runs per count must be > 0.");
        assert!(args.random_range > 0, "random range must be > 0.");
        assert!(args.first_n > 0, "first n must be > 0.");
        args
    }
}

fn setup_logger(level: log::LevelFilter) -> anyhow::Result<()> {
    let color_config = ColoredLevelConfig::new();
    fern::Dispatch::new()
        .level(level)
        .level_for("wgpu_hal", log::LevelFilter::Warn)
        .level_for("naga", log::LevelFilter::Warn)
        .level_for("wgpu_core", log::LevelFilter::Warn)
        .format(|out, message, record| {
            out.finish(format_args!(
                "{time}[{level}][{target}] {message}",
                time = chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                level = record.level(),
                target = record.target(),
                message = message,
            ))
        })
        .chain(fern::Dispatch::new().chain(std::io::stdout()).format(move |out, message, record| {
            out.finish(format_args!(
                "{color}{message}{color_reset}",
                message = message,
                color = format_args!("\x1B[{color_number}m", color_number = color_config.get_color(&record.level()).to_fg_str()),
                color_reset = "\x1B[0m",
            ))
        }))
        .apply()?;
    Ok(())
}

/// One combination of the settings matrix.
#[derive(Clone, Copy, Debug)]
struct Settings {
    power_of_two: bool,
    reverse: bool,
    negatives: bool,
    first_n: Option<usize>,
}

impl Settings {
    fn matrix(first_n: usize) -> impl Iterator<Item = Settings> {
        [None, Some(first_n)].into_iter().flat_map(|first_n| {
            [true, false].into_iter().flat_map(move |power_of_two| {
                [true, false].into_iter().flat_map(move |reverse| {
                    [true, false].into_iter().map(move |negatives| Settings { power_of_two, reverse, negatives, first_n })
                })
            })
        })
    }

    fn options(&self) -> SortOptions {
        SortOptions {
            reverse: self.reverse,
            length: self.first_n,
        }
    }
}

struct Demo<B: HostTransfer> {
    sorter: Sorter<B>,
    rng: StdRng,
    random_range: i32,
    keyed: bool,
}

impl<B: HostTransfer> Demo<B> {
    fn run(&mut self, args: &Arguments) -> anyhow::Result<usize> {
        let mut failures = 0;
        for count in args.start_count..args.end_count {
            info!("----- {count} -----");
            for settings in Settings::matrix(args.first_n) {
                match self.run_settings(count, settings, args.runs_per_count)? {
                    None => info!("Success on settings: {settings:?}"),
                    Some(attempt) => {
                        error!("Failure at attempt {attempt} on settings: {settings:?}");
                        failures += 1;
                    }
                }
            }
        }
        Ok(failures)
    }

    /// Returns the first failing attempt.
    fn run_settings(&mut self, count: usize, settings: Settings, runs: usize) -> anyhow::Result<Option<usize>> {
        for attempt in 0..runs {
            if !self.run_test(count, settings)? {
                return Ok(Some(attempt));
            }
        }
        Ok(None)
    }

    fn random_data(&mut self, count: usize, negatives: bool) -> Vec<i32> {
        let low = if negatives { -self.random_range } else { 0 };
        (0..count).map(|_| self.rng.gen_range(low..self.random_range)).collect()
    }

    fn run_test(&mut self, count: usize, settings: Settings) -> anyhow::Result<bool> {
        let count = if settings.power_of_two { count.next_power_of_two() } else { count };
        let options = settings.options();
        let length = options.effective_length(count);

        let (device_result, host_result) = if self.keyed {
            let keys = self.random_data(count, settings.negatives);
            // a pure function of the key, so equal keys carry equal values and the order is unique
            let data: Vec<i32> = keys.iter().map(|key| !key).collect();

            let mut host_keys = keys[..length].to_vec();
            sort_host(&mut host_keys, settings.reverse);
            let mut host_result: Vec<i32> = host_keys.iter().map(|key| !key).collect();
            host_result.extend_from_slice(&data[length..]);

            let backend = self.sorter.backend_mut();
            let values = backend.upload("Demo values", &data)?;
            let key_buffer = backend.upload("Demo keys", &keys)?;
            let sorted = self.sorter.sort_by_keys(&values, &key_buffer, options);
            let device_result = self.sorter.backend_mut().download(&values);
            self.sorter.backend_mut().release_buffer(key_buffer);
            self.sorter.backend_mut().release_buffer(values);
            sorted?;
            (device_result?, host_result)
        } else {
            let data = self.random_data(count, settings.negatives);

            let mut host_result = data.clone();
            sort_host(&mut host_result[..length], settings.reverse);

            let values = self.sorter.backend_mut().upload("Demo values", &data)?;
            let sorted = self.sorter.sort(&values, options);
            let device_result = self.sorter.backend_mut().download(&values);
            self.sorter.backend_mut().release_buffer(values);
            sorted?;
            (device_result?, host_result)
        };

        let matches = device_result == host_result;
        if !matches {
            error!(
                "GPU: {:?} ({}) is not equal to\n CPU: {:?} ({})",
                device_result,
                device_result.len(),
                host_result,
                host_result.len()
            );
        }
        Ok(matches)
    }
}

fn sort_host(data: &mut [i32], reverse: bool) {
    if reverse {
        data.sort_unstable_by(|a, b| b.cmp(a));
    } else {
        data.sort_unstable();
    }
}

fn run<B: HostTransfer>(backend: B, args: &Arguments, seed: u64) -> anyhow::Result<usize> {
    let mut demo = Demo {
        sorter: Sorter::new(backend),
        rng: StdRng::seed_from_u64(seed),
        random_range: args.random_range,
        keyed: args.keyed,
    };
    demo.run(args)
}

fn main() -> anyhow::Result<()> {
    let args = Arguments::parse_and_validate();
    setup_logger(args.log_level.into())?;
    debug!("{:?}", args);

    let seed = args.seed.unwrap_or_else(rand::random);
    info!("Random seed: {seed}");

    let failures = match args.backend {
        Backend::Gpu => {
            let config = WgpuBackendConfig {
                enable_profiling: args.profile,
                ..WgpuBackendConfig::default()
            };
            let backend = pollster::block_on(WgpuBackend::request(config)).context("Failed to create the wgpu backend")?;
            run(backend, &args, seed)?
        }
        Backend::Host => run(HostEmulator::new(), &args, seed)?,
    };

    if failures > 0 {
        bail!("{failures} settings failed");
    }
    info!("All settings passed");
    Ok(())
}
