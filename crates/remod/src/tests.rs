use clap::Parser;

use crate::*;

#[test]
fn test_serve_defaults() {
    let args = Args::try_parse_from(["remod", "serve"]).unwrap();
    assert!(!args.debug);
    match args.command {
        Command::Serve { port, identity } => {
            assert_eq!(port, DEFAULT_PORT);
            assert_eq!(identity, DEFAULT_IDENTITY);
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn test_serve_with_options() {
    let args = Args::try_parse_from(["remod", "serve", "--port", "0", "-i", "kiosk", "--debug"]).unwrap();
    assert!(args.debug);
    match args.command {
        Command::Serve { port, identity } => {
            assert_eq!(port, 0);
            assert_eq!(identity, "kiosk");
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn test_probe_parses_address() {
    let args = Args::try_parse_from(["remod", "probe", "127.0.0.1:7240"]).unwrap();
    match args.command {
        Command::Probe { addr, identity } => {
            assert_eq!(addr, "127.0.0.1:7240".parse::<SocketAddr>().unwrap());
            assert_eq!(identity, DEFAULT_IDENTITY);
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn test_bad_arguments_are_rejected() {
    assert!(Args::try_parse_from(["remod"]).is_err());
    assert!(Args::try_parse_from(["remod", "probe"]).is_err());
    assert!(Args::try_parse_from(["remod", "probe", "not-an-address"]).is_err());
    assert!(Args::try_parse_from(["remod", "serve", "--port", "70000"]).is_err());
}
