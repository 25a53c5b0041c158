//! nabla - command line front end for the blit, ray-query and material paths.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context as _, Result};

use nabla::asset::{AssetManager, GpuObjectConverter};
use nabla::blit::{
    blit_blocking, BlitPipelines, BlitState, BoxKernel, Image, Kernel, LanczosKernel, TexelFormat, TriangleKernel,
};
use nabla::config::{BackendKind, Config};
use nabla::material::MaterialCompiler;
use nabla::scene::{demo_spheres, SphereRenderer, SphereScene};
use nabla::util::Extent3;
use nabla::video::{open_device, Context};

struct Options {
    config: Option<PathBuf>,
    backend: Option<BackendKind>,
    log_level: &'static str,
    args: Vec<String>,
}

fn parse_options() -> Options {
    let mut options = Options { config: None, backend: None, log_level: "info", args: Vec::new() };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-v" | "--verbose" => options.log_level = "debug",
            "-vv" | "--trace" => options.log_level = "trace",
            "-q" | "--quiet" => options.log_level = "error",
            "--host" => options.backend = Some(BackendKind::Host),
            "--wgpu" => options.backend = Some(BackendKind::Wgpu),
            "--config" => options.config = it.next().map(PathBuf::from),
            _ => options.args.push(arg),
        }
    }
    options
}

fn open_context(options: &Options) -> Result<Context> {
    let mut config = match &options.config {
        Some(path) => Config::load(path).with_context(|| format!("reading {}", path.display()))?,
        None => Config::load_or_default(),
    };
    if let Some(backend) = options.backend {
        config.device.backend = backend;
    }
    let device = open_device(&config)?;
    Ok(Context::new(device, config))
}

fn main() -> Result<()> {
    let options = parse_options();
    let _guard = nabla::logging::init_tracing(options.log_level);

    let args: Vec<&str> = options.args.iter().map(String::as_str).collect();
    match args.as_slice() {
        [] | ["h" | "help" | "-h" | "--help"] => print_help(),
        ["--version" | "-V"] => print_version(),
        ["i" | "info"] => cmd_info(&open_context(&options)?),
        ["b" | "blit", input, output, size, rest @ ..] => {
            cmd_blit(&open_context(&options)?, Path::new(input), Path::new(output), size, rest)?
        }
        ["r" | "rayquery", output, rest @ ..] => cmd_rayquery(&open_context(&options)?, Path::new(output), rest)?,
        ["m" | "material", input] => cmd_material(Path::new(input))?,
        [cmd, ..] => {
            print_help();
            bail!("unknown command or missing arguments: {cmd}");
        }
    }
    Ok(())
}

fn print_version() {
    println!("nabla {} (built {} {})", env!("CARGO_PKG_VERSION"), env!("NABLA_BUILD_DATE"), env!("NABLA_BUILD_TIME"));
}

fn print_help() {
    println!("nabla - compute blits, ray queries and material compilation");
    println!();
    println!("USAGE:");
    println!("    nabla-cli [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    i, info                                   Show device name, limits and features");
    println!("    b, blit <in> <out> <WxH> [flags]          Resample an image on the device");
    println!("            --coverage <alpha>                  preserve alpha-test coverage at <alpha>");
    println!("            --kernel box|triangle|lanczos       reconstruction kernel (default box)");
    println!("    r, rayquery <out> [frames] [WxH]          Render the sphere scene with ray queries");
    println!("            --env <image>                       equirectangular environment map");
    println!("    m, material <graph.json>                  Compile a BSDF graph and dump its IR");
    println!("    h, help                                   Show this help");
    println!();
    println!("OPTIONS:");
    println!("    --host | --wgpu      Override the configured backend");
    println!("    --config <file>      Configuration file (default <config dir>/nabla/config.json)");
    println!("    -v, --verbose        Show debug output");
    println!("    -vv, --trace         Show trace output (very verbose)");
    println!("    -q, --quiet          Errors only");
    println!("    -V, --version        Show version and build date");
    println!();
    println!("ENVIRONMENT:");
    println!("    NABLA_LOG            Log filter, overrides -v/-q (e.g. nabla::blit=trace)");
    println!("    NABLA_TRACE=1        Write trace.json (builds with the trace feature)");
    println!();
}

fn parse_size(text: &str) -> Result<(u32, u32)> {
    let (w, h) = text.split_once(['x', 'X']).with_context(|| format!("expected WxH, got '{text}'"))?;
    Ok((w.parse()?, h.parse()?))
}

fn cmd_info(ctx: &Context) {
    let device = ctx.device();
    let limits = device.limits();
    let features = device.features();
    println!("Device:        {}", device.name());
    println!("Backend:       {:?}", ctx.config().device.backend);
    println!("Workgroup:     {:?} (max {} invocations)", limits.max_compute_workgroup_size, limits.max_compute_workgroup_invocations);
    println!("Shared memory: {} bytes", limits.max_compute_shared_memory_size);
    println!("Max buffer:    {} bytes", limits.max_buffer_size);
    println!("Push consts:   {} bytes", limits.max_push_constants_size);
    println!("Accel struct:  {}", features.acceleration_structure);
    println!("Ray query:     {}", features.ray_query);
    println!("In flight:     {} frames", ctx.config().device.frames_in_flight);
}

fn cmd_blit(ctx: &Context, input: &Path, output: &Path, size: &str, rest: &[&str]) -> Result<()> {
    let (width, height) = parse_size(size)?;
    let image = Image::load(input)?;
    let mut state = BlitState::new(image.extent(), Extent3::d2(width, height));
    let mut it = rest.iter();
    while let Some(flag) = it.next() {
        match *flag {
            "--coverage" => {
                let alpha: f32 = it.next().context("--coverage needs a reference alpha")?.parse()?;
                state = state.with_coverage(alpha);
            }
            "--kernel" => {
                let kernel: Arc<dyn Kernel> = match it.next().copied() {
                    Some("box") => Arc::new(BoxKernel),
                    Some("triangle") => Arc::new(TriangleKernel),
                    Some("lanczos") => Arc::new(LanczosKernel::default()),
                    other => bail!("unknown kernel {other:?}"),
                };
                state = state.with_kernel(kernel);
            }
            other => bail!("unknown blit flag '{other}'"),
        }
    }

    let start = Instant::now();
    let pipelines = BlitPipelines::new(ctx)?;
    let result = blit_blocking(ctx, &pipelines, &state, &image, output_format(output))?;
    result.save(output)?;
    println!(
        "{} {:?} -> {:?} in {:.1} ms (coverage {})",
        output.display(),
        image.extent(),
        result.extent(),
        start.elapsed().as_secs_f64() * 1e3,
        state.coverage()
    );
    Ok(())
}

fn output_format(path: &Path) -> TexelFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("exr" | "hdr") => TexelFormat::Rgba32Float,
        _ => TexelFormat::Rgba8Srgb,
    }
}

fn cmd_rayquery(ctx: &Context, output: &Path, rest: &[&str]) -> Result<()> {
    let mut frames = 16u32;
    let mut size = (640u32, 480u32);
    let mut environment = None;
    let mut it = rest.iter();
    while let Some(arg) = it.next() {
        match *arg {
            "--env" => environment = Some(PathBuf::from(it.next().context("--env needs an image")?)),
            text if text.contains(['x', 'X']) => size = parse_size(text)?,
            text => frames = text.parse().with_context(|| format!("bad frame count '{text}'"))?,
        }
    }

    let start = Instant::now();
    let environment = match environment {
        Some(path) => {
            let bundle = AssetManager::new().load(&path)?;
            let image = bundle.image().with_context(|| format!("{} is not an image", path.display()))?;
            GpuObjectConverter::new(ctx).begin(&[image])?.wait()?.pop()
        }
        None => None,
    };
    let scene = SphereScene::build(ctx, &demo_spheres())?;
    let mut renderer = SphereRenderer::new(ctx, &scene, size.0, size.1, environment)?;
    let image = renderer.render(ctx, frames)?;
    let converted = Image::from_linear(image.extent(), output_format(output), &image.to_linear())?;
    converted.save(output)?;
    println!(
        "{} {}x{} {} frames in {:.1} ms ({} ring waits)",
        output.display(),
        size.0,
        size.1,
        frames,
        start.elapsed().as_secs_f64() * 1e3,
        renderer.ring_waits()
    );
    if let Some(image) = environment {
        ctx.device().destroy_buffer(image.buffer)?;
    }
    Ok(())
}

fn cmd_material(input: &Path) -> Result<()> {
    // bitmap filenames are relative to the graph
    let root = input.parent().map(Path::to_path_buf).unwrap_or_default();
    let name = input.file_name().with_context(|| format!("{} is not a file", input.display()))?;
    let assets = AssetManager::new().with_root(root);
    let bundle = assets.load(Path::new(name))?;
    let graph = bundle.bsdf().with_context(|| format!("{} is not a BSDF graph", input.display()))?;
    let textures = assets.preload_textures(&graph)?;

    let mut compiler = MaterialCompiler::new();
    let roots = compiler.compile_all(&graph, assets.cache().as_ref())?;
    println!("{}: {} roots, {} textures, {} IR nodes", input.display(), roots.len(), textures, compiler.ir().len());
    for (element, fb) in roots {
        println!("element {element} front:");
        print!("{}", compiler.ir().dump(fb.front));
        if fb.back != fb.front {
            println!("element {element} back:");
            print!("{}", compiler.ir().dump(fb.back));
        }
    }
    Ok(())
}
