mod support;

use std::sync::Arc;

use clap::Parser;
use httpdirfs::cli::Cli;
use httpdirfs::config::Config;
use httpdirfs::link::{LinkKind, LinkSystem};
use httpdirfs::transfer::Transfer;
use support::{SiteSpec, TestServer};

const GET_INDEXES: &str = r#"{"subsonic-response":{"status":"ok","version":"1.13.0",
  "indexes":{"index":[{"name":"A","artist":[{"id":"1","name":"ABBA"}]}],
  "child":[{"id":"90","isDir":false,"title":"loose track","size":1000,
            "suffix":"mp3","created":"2004-11-08T23:36:11"}]}}}"#;

const GET_MUSIC_DIRECTORY: &str = r#"{"subsonic-response":{"status":"ok","version":"1.13.0",
  "directory":{"id":"1","name":"ABBA","child":[
    {"id":"11","isDir":true,"title":"Arrival"},
    {"id":"111","isDir":false,"title":"Dancing Queen","size":3037672,
     "suffix":"mp3","created":"2004-11-08T23:36:11"}]}}}"#;

const GET_ARTISTS: &str = r#"{"subsonic-response":{"status":"ok","version":"1.13.0",
  "artists":{"index":[{"name":"A","artist":[{"id":"5","name":"ABBA"}]}]}}}"#;

const GET_ARTIST: &str = r#"{"subsonic-response":{"status":"ok","version":"1.13.0",
  "artist":{"id":"5","name":"ABBA","album":[
    {"id":"51","name":"Arrival","created":"2004-11-08T23:36:11"}]}}}"#;

const GET_ALBUM: &str = r#"{"subsonic-response":{"status":"ok","version":"1.13.0",
  "album":{"id":"51","name":"Arrival","song":[
    {"id":"511","title":"Dancing Queen","size":3037672,"suffix":"mp3",
     "created":"2004-11-08T23:36:11"}]}}}"#;

fn make_system(base: &str, extra: &[&str]) -> Arc<LinkSystem> {
    let mut args = vec![
        "httpdirfs",
        "--retry-wait",
        "0",
        "--sonic-username",
        "admin",
        "--sonic-password",
        "sesame",
    ];
    args.extend_from_slice(extra);
    args.push(base);
    args.push("/mnt/sonic");
    let config = Config::from_cli(&Cli::parse_from(args)).expect("config");
    let transfer = Arc::new(Transfer::init(&config).expect("transfer engine"));
    LinkSystem::init(&config, transfer, None).expect("link system")
}

#[test]
fn index_mode_walks_directories_by_id() {
    let server = TestServer::start(SiteSpec {
        dirs: vec![
            ("/rest/getIndexes.view".to_string(), GET_INDEXES.to_string()),
            ("/rest/getMusicDirectory.view".to_string(), GET_MUSIC_DIRECTORY.to_string()),
        ],
        ..SiteSpec::default()
    });
    let links = make_system(&server.base, &[]);

    let mut names: Vec<String> = links
        .list_dir("/")
        .expect("root listing")
        .into_iter()
        .map(|l| l.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["ABBA", "loose track.mp3"]);

    let track = links.resolve("/loose track.mp3").expect("loose track");
    assert_eq!(track.kind, LinkKind::File);
    assert_eq!(track.content_length, 1000);
    assert!(track.f_url.contains("/rest/download.view"));

    let song = links.resolve("/ABBA/Dancing Queen.mp3").expect("song");
    assert_eq!(song.kind, LinkKind::File);
    assert_eq!(song.content_length, 3_037_672);
    assert!(song.time > 0);

    let album = links.resolve("/ABBA/Arrival").expect("album dir");
    assert_eq!(album.kind, LinkKind::Dir);
    assert_eq!(server.hits("GET", "/rest/getMusicDirectory.view"), 1);
}

#[test]
fn id3_mode_layers_artist_album_song() {
    let server = TestServer::start(SiteSpec {
        dirs: vec![
            ("/rest/getArtists.view".to_string(), GET_ARTISTS.to_string()),
            ("/rest/getArtist.view".to_string(), GET_ARTIST.to_string()),
            ("/rest/getAlbum.view".to_string(), GET_ALBUM.to_string()),
        ],
        ..SiteSpec::default()
    });
    let links = make_system(&server.base, &["--sonic-id3"]);

    let root: Vec<String> = links
        .list_dir("/")
        .expect("artists")
        .into_iter()
        .map(|l| l.name)
        .collect();
    assert_eq!(root, vec!["ABBA"]);

    let albums: Vec<String> = links
        .list_dir("/ABBA")
        .expect("albums")
        .into_iter()
        .map(|l| l.name)
        .collect();
    assert_eq!(albums, vec!["Arrival"]);

    let song = links.resolve("/ABBA/Arrival/Dancing Queen.mp3").expect("song");
    assert_eq!(song.kind, LinkKind::File);
    assert_eq!(song.content_length, 3_037_672);
    assert!(song.f_url.contains("/rest/download.view"));
    assert!(song.f_url.contains("id=511"));

    assert_eq!(server.hits("GET", "/rest/getArtists.view"), 1);
    assert_eq!(server.hits("GET", "/rest/getArtist.view"), 1);
    assert_eq!(server.hits("GET", "/rest/getAlbum.view"), 1);
}
