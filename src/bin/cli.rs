//! Command-line client: sends one command as a request frame and prints the
//! tagged response.

use std::io::{Read, Write};
use std::net::SocketAddr;

use anyhow::{bail, Context};
use clap::Parser;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use zetkv::protocol::{Tag, K_MAX_MSG};

#[derive(Parser, Debug)]
#[command(author, version, about = "zetkv command-line client", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:1234")]
    addr: SocketAddr,

    /// Command and its arguments, e.g. `zadd board 9.5 alice`
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn encode_request(args: &[String]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(args.len() as u32).to_le_bytes());
    for arg in args {
        payload.extend_from_slice(&(arg.len() as u32).to_le_bytes());
        payload.extend_from_slice(arg.as_bytes());
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}

fn take_u32(data: &[u8], pos: &mut usize) -> anyhow::Result<u32> {
    let bytes = data
        .get(*pos..*pos + 4)
        .context("response ended mid-value")?;
    *pos += 4;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
}

fn take_bytes<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> anyhow::Result<&'a [u8]> {
    let bytes = data
        .get(*pos..*pos + len)
        .context("response ended mid-value")?;
    *pos += len;
    Ok(bytes)
}

fn print_value(data: &[u8], pos: &mut usize, indent: usize) -> anyhow::Result<()> {
    let pad = "  ".repeat(indent);
    let tag = *data.get(*pos).context("response ended mid-value")?;
    *pos += 1;
    match tag {
        t if t == Tag::Nil as u8 => println!("{pad}(nil)"),
        t if t == Tag::Err as u8 => {
            let code = take_u32(data, pos)?;
            let len = take_u32(data, pos)? as usize;
            let msg = String::from_utf8_lossy(take_bytes(data, pos, len)?).into_owned();
            println!("{pad}(err) [{code}] {msg}");
        }
        t if t == Tag::Str as u8 => {
            let len = take_u32(data, pos)? as usize;
            let s = String::from_utf8_lossy(take_bytes(data, pos, len)?).into_owned();
            println!("{pad}(str) {s}");
        }
        t if t == Tag::Int as u8 => {
            let bytes = take_bytes(data, pos, 8)?;
            println!("{pad}(int) {}", i64::from_le_bytes(bytes.try_into()?));
        }
        t if t == Tag::Dbl as u8 => {
            let bytes = take_bytes(data, pos, 8)?;
            println!("{pad}(dbl) {}", f64::from_le_bytes(bytes.try_into()?));
        }
        t if t == Tag::Arr as u8 => {
            let n = take_u32(data, pos)?;
            println!("{pad}(arr) len={n}");
            for _ in 0..n {
                print_value(data, pos, indent + 1)?;
            }
        }
        t => bail!("unknown response tag {t}"),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    sock.connect(&SockAddr::from(args.addr))
        .with_context(|| format!("cannot connect to {}", args.addr))?;

    sock.write_all(&encode_request(&args.command))?;

    let mut header = [0u8; 4];
    sock.read_exact(&mut header).context("reading response")?;
    let len = u32::from_le_bytes(header) as usize;
    if len > K_MAX_MSG {
        bail!("response length {len} over limit");
    }
    let mut body = vec![0u8; len];
    sock.read_exact(&mut body).context("reading response")?;

    let mut pos = 0;
    print_value(&body, &mut pos, 0)?;
    if pos != body.len() {
        bail!("trailing bytes after response value");
    }
    Ok(())
}
