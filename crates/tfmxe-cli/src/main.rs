use {
    anyhow::Context,
    clap::Parser,
    console::Term,
    std::{
        fs::File,
        io::Write as _,
        process::{Command, Stdio},
        sync::mpsc::{Receiver, Sender},
    },
    tfmxe::{Config, Player, PlayerBuilder},
};

#[derive(clap::Parser)]
struct Args {
    mdat_path: String,
    #[arg(short = 's', long)]
    smpl_path: Option<String>,
    /// Sub-song index
    #[arg(short = 't', long, default_value = "0")]
    song: usize,
    #[arg(short = 'r', long, default_value = "44100")]
    sample_rate: u32,
    /// Write raw s16le stereo to this file instead of piping to aplay
    #[arg(short = 'o', long)]
    output: Option<String>,
    /// Low-pass filter strength (0-3)
    #[arg(short = 'f', long, default_value = "0")]
    filter: u8,
    /// Disable stereo blending
    #[arg(long)]
    no_blend: bool,
    /// Loop count; 0 plays forever, negative stops at sub-song end
    #[arg(short = 'l', long, default_value = "-1")]
    loops: i32,
}

enum Msg {
    Prev,
    Next,
    ToggleBlend,
    ToggleCh(u8),
    End,
}

const FRAMES_PER_WRITE: usize = 1024;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_env("RUST_LOG")
        .init();
    let (send, recv) = std::sync::mpsc::channel();
    let interactive = args.output.is_none();
    let th_handle = std::thread::spawn(move || {
        if let Err(e) = play(&args, &recv) {
            log::error!("{e:#}");
        }
    });
    if interactive {
        key_loop(&send);
    }
    th_handle.join().ok();
    Ok(())
}

fn key_loop(send: &Sender<Msg>) {
    let term = Term::stdout();
    loop {
        match term.read_char() {
            Ok(ch) => match ch {
                '<' => drop(send.send(Msg::Prev)),
                '>' => drop(send.send(Msg::Next)),
                'b' => drop(send.send(Msg::ToggleBlend)),
                'q' => {
                    drop(send.send(Msg::End));
                    break;
                }
                '1'..='8' => drop(send.send(Msg::ToggleCh(ch as u8 - b'1'))),
                _ => {}
            },
            Err(e) => {
                eprintln!("{e}");
                break;
            }
        }
    }
}

enum Sink {
    Aplay(std::process::Child),
    File(File),
}

impl Sink {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Aplay(child) => match &mut child.stdin {
                Some(stdin) => stdin.write_all(bytes),
                None => Ok(()),
            },
            Self::File(f) => f.write_all(bytes),
        }
    }
}

fn play(args: &Args, recv: &Receiver<Msg>) -> anyhow::Result<()> {
    let mut builder = PlayerBuilder::new(&args.mdat_path);
    if let Some(smpl) = &args.smpl_path {
        builder.smpl_file(smpl);
    }
    let song_data = builder.build().context("Failed to load song files")?;
    let module = song_data.module().context("Failed to parse module")?;
    for row in module.header.text_rows() {
        log::info!("{row}");
    }
    let sub_songs = module.sub_song_count().max(1);

    let mut sink = match &args.output {
        Some(path) => Sink::File(File::create(path).context("Failed to create output file")?),
        None => {
            let mut cmd = Command::new("aplay");
            cmd.args(["-f", "s16_le", "-r", &args.sample_rate.to_string(), "-c", "2"]);
            cmd.stdin(Stdio::piped());
            Sink::Aplay(cmd.spawn().context("Failed to spawn aplay")?)
        }
    };

    let mut player = Player::with_config(
        args.sample_rate,
        Config {
            blend: !args.no_blend,
            filter_level: args.filter.min(3),
            loops: args.loops,
            ..Config::default()
        },
    );
    player.load(module);
    let mut song_idx = args.song.min(sub_songs - 1);
    player.start_song(song_idx, false);
    log::info!("Playing sub-song {song_idx}/{sub_songs}");

    let mut ch_on = [true; 8];
    let mut left = [0.0f32; FRAMES_PER_WRITE];
    let mut right = [0.0f32; FRAMES_PER_WRITE];
    let mut pcm = [0i16; FRAMES_PER_WRITE * 2];
    let mut total_frames: usize = 0;
    let begin = std::time::Instant::now();
    loop {
        while let Ok(msg) = recv.try_recv() {
            match msg {
                Msg::Prev => {
                    song_idx = song_idx.saturating_sub(1);
                    player.start_song(song_idx, false);
                    log::info!("Sub-song {song_idx}");
                }
                Msg::Next => {
                    song_idx = (song_idx + 1).min(sub_songs - 1);
                    player.start_song(song_idx, false);
                    log::info!("Sub-song {song_idx}");
                }
                Msg::ToggleBlend => {
                    let cfg = player.config_mut();
                    cfg.blend ^= true;
                    let on_off = if cfg.blend { "on" } else { "off" };
                    log::info!("Stereo blend {on_off}");
                }
                Msg::ToggleCh(ch) => match ch_on.get_mut(usize::from(ch)) {
                    Some(on) => {
                        *on ^= true;
                        player.set_channel_enabled(usize::from(ch), *on);
                        let vis: String =
                            ch_on.iter().map(|&b| if b { 'X' } else { '_' }).collect();
                        log::info!("Channel status: {vis}");
                    }
                    None => log::warn!("No such channel: {ch}"),
                },
                Msg::End => {
                    log::info!("Stopping playback on request.");
                    return Ok(());
                }
            }
        }
        if !player.display_state().active {
            // sub-song ran out; move on or finish
            if song_idx + 1 >= sub_songs {
                log::info!("Song finished.");
                return Ok(());
            }
            song_idx += 1;
            player.start_song(song_idx, false);
            log::info!("Sub-song {song_idx}");
            continue;
        }
        player.render(&mut left, &mut right);
        for (i, (l, r)) in left.iter().zip(right.iter()).enumerate() {
            pcm[i * 2] = (l * 32_767.0) as i16;
            pcm[i * 2 + 1] = (r * 32_767.0) as i16;
        }
        sink.write(bytemuck::cast_slice(&pcm))
            .context("Error writing samples")?;
        total_frames += FRAMES_PER_WRITE;
        eprint!(
            "[tfmxe] ({:.02}) {} frames rendered (approx {} seconds)\r",
            begin.elapsed().as_secs_f32(),
            total_frames,
            total_frames / args.sample_rate as usize
        );
    }
}
