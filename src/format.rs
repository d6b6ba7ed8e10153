//! Quality token → yt-dlp format selector.
//!
//! Every chain prefers an AVC/M4A pair that merges into MP4 without
//! re-encoding, then a pre-merged MP4, then whatever the source offers.

const BEST: &str = "bestvideo[ext=mp4][vcodec^=avc]+bestaudio[ext=m4a]/best[ext=mp4]/bestvideo+bestaudio/best";
const UHD_4K: &str = "bestvideo[height<=2160][ext=mp4][vcodec^=avc]+bestaudio[ext=m4a]/best[height<=2160][ext=mp4]/bestvideo[height<=2160]+bestaudio/best";
const P1080: &str = "bestvideo[height<=1080][ext=mp4][vcodec^=avc]+bestaudio[ext=m4a]/best[height<=1080][ext=mp4]/bestvideo[height<=1080]+bestaudio/best";
const P720: &str = "bestvideo[height<=720][ext=mp4][vcodec^=avc]+bestaudio[ext=m4a]/best[height<=720][ext=mp4]/bestvideo[height<=720]+bestaudio/best";
const P480: &str = "bestvideo[height<=480][ext=mp4][vcodec^=avc]+bestaudio[ext=m4a]/best[height<=480][ext=mp4]/bestvideo[height<=480]+bestaudio/best";
const P360: &str = "bestvideo[height<=360][ext=mp4][vcodec^=avc]+bestaudio[ext=m4a]/best[height<=360][ext=mp4]/bestvideo[height<=360]+bestaudio/best";

/// Looks up the selector for a quality token. Unknown tokens get the `best`
/// chain.
pub fn select_format(quality: &str) -> &'static str {
    match quality {
        "4k" => UHD_4K,
        "1080p" => P1080,
        "720p" => P720,
        "480p" => P480,
        "360p" => P360,
        _ => BEST,
    }
}
