// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Client for TheSkyX's TCP scripting server. Each request is a small
// JavaScript program wrapped in start/end markers; the server runs it and
// replies with a line of text. A new connection is opened for every request.
//
// Note that a reply received without socket errors is not necessarily a
// success: the server reports script exceptions as reply text, e.g.
// "TypeError: Process aborted.|...". Such replies are turned into errors here.

use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError,
                      deadline_exceeded_error, failed_precondition_error,
                      invalid_argument_error, not_found_error,
                      unavailable_error};
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::options::SaveDestination;

pub const DEFAULT_PORT: u16 = 3040;

const MAX_RECEIVE_SIZE: usize = 1024;
const PACKET_START: &str = "/* Java Script *//* Socket Start Packet */";
const PACKET_END: &str = "/* Socket End Packet */";

// Frame type codes used by ccdsoftCamera.Frame.
const FRAME_TYPE_BIAS: u32 = 2;
const FRAME_TYPE_FLAT: u32 = 4;

// Range of plausible CCD temperatures, Celsius.
const MIN_TEMPERATURE: f64 = -270.0;
const MAX_TEMPERATURE: f64 = 200.0;

/// The operations the acquisition session needs from the imaging server.
/// Every method is a single request/response exchange; none of them retry.
#[async_trait]
pub trait ImagingServer {
    async fn connect_camera(&self) -> Result<(), CanonicalError>;
    async fn disconnect_camera(&self) -> Result<(), CanonicalError>;
    async fn connect_filter_wheel(&self) -> Result<(), CanonicalError>;

    // `index` Zero-based filter wheel position.
    async fn select_filter(&self, index: u32) -> Result<(), CanonicalError>;

    // Zero-length exposure, used for timing image downloads. When
    // `asynchronous` is false the call returns after the frame is downloaded.
    async fn take_bias_frame(&self, binning: u32, asynchronous: bool)
                             -> Result<(), CanonicalError>;

    // Starts a flat exposure and returns immediately. Poll
    // exposure_is_complete() to learn when the frame is available.
    async fn start_flat_exposure(&self, seconds: f64, binning: u32)
                                 -> Result<(), CanonicalError>;

    async fn exposure_is_complete(&self) -> Result<bool, CanonicalError>;
    async fn abort_exposure(&self) -> Result<(), CanonicalError>;

    // Average pixel value of the most recently acquired image.
    async fn average_adu(&self) -> Result<f64, CanonicalError>;

    async fn save_last_image(&self, destination: &SaveDestination,
                             file_name: &str) -> Result<(), CanonicalError>;

    // The server's own autosave directory.
    async fn autosave_path(&self) -> Result<String, CanonicalError>;

    // `target_celsius` is ignored when `on` is false.
    async fn set_camera_cooling(&self, on: bool, target_celsius: f64)
                                -> Result<(), CanonicalError>;
    async fn camera_temperature(&self) -> Result<f64, CanonicalError>;

    async fn connect_telescope(&self) -> Result<(), CanonicalError>;

    // Returns (altitude, azimuth), degrees.
    async fn scope_alt_az(&self) -> Result<(f64, f64), CanonicalError>;

    // Starts a slew and returns; poll slew_is_complete().
    async fn start_slew_to(&self, alt: f64, az: f64) -> Result<(), CanonicalError>;

    // Returns when the mount reports the slew done.
    async fn slew_to(&self, alt: f64, az: f64) -> Result<(), CanonicalError>;

    async fn slew_is_complete(&self) -> Result<bool, CanonicalError>;
    async fn abort_slew(&self) -> Result<(), CanonicalError>;
    async fn home_mount(&self) -> Result<(), CanonicalError>;
    async fn set_tracking(&self, on: bool) -> Result<(), CanonicalError>;
    async fn park_mount(&self) -> Result<(), CanonicalError>;
    async fn disconnect_telescope(&self) -> Result<(), CanonicalError>;
}

/// JavaScript spelling of a boolean.
pub fn js_bool(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// Wraps a script in the markers the server expects.
pub fn command_packet(command: &str) -> String {
    format!("{}{}{}", PACKET_START, command, PACKET_END)
}

/// Returns an error if `reply` is an exception reported by the server.
pub fn check_for_embedded_error(reply: &str) -> Result<(), CanonicalError> {
    let upper = reply.to_uppercase();
    if upper.starts_with("TYPEERROR: PROCESS ABORTED") {
        return Err(failed_precondition_error("Camera Aborted"));
    }
    if upper.starts_with("TYPEERROR: CFITSIO ERROR") {
        return Err(failed_precondition_error(
            "File save folder doesn't exist or not writeable"));
    }
    if upper.starts_with("TYPEERROR:") {
        return Err(failed_precondition_error(reply));
    }
    Ok(())
}

// Replies of the form "<code>|<message>", where code 0 means success.
fn check_result_code(reply: &str) -> Result<(), CanonicalError> {
    check_for_embedded_error(reply)?;
    let code = reply.split('|').next().unwrap_or("").trim();
    if code != "0" {
        return Err(failed_precondition_error(reply));
    }
    Ok(())
}

fn parse_number(reply: &str, what: &str) -> Result<f64, CanonicalError> {
    match reply.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(invalid_argument_error(
            format!("Invalid {} \"{}\" from server", what, reply).as_str())),
    }
}

// Script suffix that makes the server reply with the value of `var_name`.
fn reply_with(var_name: &str) -> String {
    format!("var Out;Out={}+\"\\n\";", var_name)
}

pub struct SkyXClient {
    address: String,
    port: u16,
    connect_timeout: Duration,
    reply_timeout: Duration,

    // The server handles one script at a time; we hold this for the
    // duration of each request/response exchange.
    connection_lock: tokio::sync::Mutex<()>,
}

impl SkyXClient {
    pub fn new(address: &str, port: u16) -> Self {
        SkyXClient{
            address: address.to_string(),
            port,
            connect_timeout: Duration::from_secs(10),
            // Synchronous exposures and slews reply only when done.
            reply_timeout: Duration::from_secs(300),
            connection_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration,
                         reply_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.reply_timeout = reply_timeout;
        self
    }

    pub fn address(&self) -> &str { &self.address }
    pub fn port(&self) -> u16 { self.port }

    /// Sends `command` and returns the first line of the reply. Only
    /// transport failures are errors here; the reply text is not examined.
    pub async fn send_command(&self, command: &str) -> Result<String, CanonicalError> {
        debug!("Sending: {}", command);
        let result = self.send_command_packet(&command_packet(command)).await;
        match &result {
            Ok(reply) => debug!("Reply: {}", reply),
            Err(e) => warn!("Command to {}:{} failed: {}",
                            self.address, self.port, e.message),
        }
        result
    }

    // As send_command(), but a reply carrying a server exception is an error.
    async fn send_checked(&self, command: &str) -> Result<String, CanonicalError> {
        let reply = self.send_command(command).await?;
        check_for_embedded_error(&reply)?;
        Ok(reply)
    }

    async fn send_command_packet(&self, packet: &str) -> Result<String, CanonicalError> {
        let _lock = self.connection_lock.lock().await;
        let server = format!("{}:{}", self.address, self.port);

        let mut addrs = tokio::net::lookup_host((self.address.as_str(), self.port))
            .await.map_err(|e| not_found_error(
                format!("Cannot resolve {}: {}", server, e).as_str()))?;
        let Some(addr) = addrs.next() else {
            return Err(not_found_error(
                format!("No address found for {}", server).as_str()));
        };

        let mut stream = match timeout(self.connect_timeout,
                                       TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(deadline_exceeded_error(
                    format!("Timed out connecting to {}", server).as_str()));
            }
            Ok(Err(e)) => {
                return Err(unavailable_error(
                    format!("Cannot connect to {}: {}", server, e).as_str()));
            }
            Ok(Ok(s)) => s,
        };

        match timeout(self.reply_timeout,
                      Self::exchange(&mut stream, packet)).await {
            Err(_) => Err(deadline_exceeded_error(
                format!("Timed out waiting for reply from {}", server).as_str())),
            Ok(Err(e)) => Err(unavailable_error(
                format!("Error communicating with {}: {}", server, e).as_str())),
            Ok(Ok(reply)) => Ok(reply),
        }
    }

    async fn exchange(stream: &mut TcpStream, packet: &str)
                      -> Result<String, std::io::Error> {
        stream.write_all(packet.as_bytes()).await?;
        // The server neither terminates every reply with a newline nor closes
        // the connection, so we take whatever the first read delivers.
        let mut buffer = [0u8; MAX_RECEIVE_SIZE];
        let received = stream.read(&mut buffer).await?;
        let text = String::from_utf8_lossy(&buffer[..received]);
        let first_line = text.split('\n').next().unwrap_or("");
        Ok(first_line.trim_end_matches('\r').to_string())
    }

    async fn query_bool(&self, expression: &str) -> Result<bool, CanonicalError> {
        let reply = self.send_checked(
            format!("var done={};{}", expression, reply_with("done")).as_str()).await?;
        let value = parse_number(&reply, "completion flag")?;
        Ok(value != 0.0)
    }
}

#[async_trait]
impl ImagingServer for SkyXClient {
    async fn connect_camera(&self) -> Result<(), CanonicalError> {
        self.send_checked("ccdsoftCamera.Connect();").await?;
        Ok(())
    }

    async fn disconnect_camera(&self) -> Result<(), CanonicalError> {
        self.send_checked("ccdsoftCamera.Disconnect();").await?;
        Ok(())
    }

    async fn connect_filter_wheel(&self) -> Result<(), CanonicalError> {
        self.send_checked("ccdsoftCamera.filterWheelConnect();").await?;
        Ok(())
    }

    async fn select_filter(&self, index: u32) -> Result<(), CanonicalError> {
        self.send_checked(
            format!("ccdsoftCamera.FilterIndexZeroBased={};", index).as_str()).await?;
        Ok(())
    }

    async fn take_bias_frame(&self, binning: u32, asynchronous: bool)
                             -> Result<(), CanonicalError> {
        let command = format!(
            "ccdsoftCamera.Autoguider=false;\
             ccdsoftCamera.Asynchronous={};\
             ccdsoftCamera.Frame={};\
             ccdsoftCamera.ImageReduction=0;\
             ccdsoftCamera.ToNewWindow=false;\
             ccdsoftCamera.ccdsoftAutoSaveAs=0;\
             ccdsoftCamera.AutoSaveOn=false;\
             ccdsoftCamera.BinX={};\
             ccdsoftCamera.BinY={};\
             ccdsoftCamera.ExposureTime=0;\
             var cameraResult=ccdsoftCamera.TakeImage();{}",
            js_bool(asynchronous), FRAME_TYPE_BIAS, binning, binning,
            reply_with("cameraResult"));
        let reply = self.send_command(&command).await?;
        check_result_code(&reply)
    }

    async fn start_flat_exposure(&self, seconds: f64, binning: u32)
                                 -> Result<(), CanonicalError> {
        let command = format!(
            "ccdsoftCamera.Autoguider=false;\
             ccdsoftCamera.Asynchronous=true;\
             ccdsoftCamera.Frame={};\
             ccdsoftCamera.ImageReduction=0;\
             ccdsoftCamera.ToNewWindow=false;\
             ccdsoftCamera.ccdsoftAutoSaveAs=0;\
             ccdsoftCamera.AutoSaveOn=false;\
             ccdsoftCamera.BinX={};\
             ccdsoftCamera.BinY={};\
             ccdsoftCamera.ExposureTime={};\
             var cameraResult=ccdsoftCamera.TakeImage();{}",
            FRAME_TYPE_FLAT, binning, binning, seconds,
            reply_with("cameraResult"));
        let reply = self.send_command(&command).await?;
        check_result_code(&reply)
    }

    async fn exposure_is_complete(&self) -> Result<bool, CanonicalError> {
        let reply = self.send_command(
            format!("var complete=ccdsoftCamera.IsExposureComplete;{}",
                    reply_with("complete")).as_str()).await?;
        match reply.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            // E.g. the exposure was aborted from the server's own UI.
            other => Err(failed_precondition_error(
                other.split('|').next().unwrap_or(other))),
        }
    }

    async fn abort_exposure(&self) -> Result<(), CanonicalError> {
        self.send_checked("ccdsoftCamera.Abort();").await?;
        Ok(())
    }

    async fn average_adu(&self) -> Result<f64, CanonicalError> {
        let reply = self.send_checked(
            format!("ccdsoftCameraImage.AttachToActive();\
                     var averageAdu=ccdsoftCameraImage.averagePixelValue();{}",
                    reply_with("averageAdu")).as_str()).await?;
        parse_number(&reply, "ADU value")
    }

    async fn save_last_image(&self, destination: &SaveDestination,
                             file_name: &str) -> Result<(), CanonicalError> {
        let path_assignment = match destination {
            SaveDestination::Local(directory) =>
                format!("img.Path='{}/{}';", directory.display(), file_name),
            SaveDestination::Autosave =>
                format!("asp=cam.AutoSavePath;img.Path=asp+'/{}';", file_name),
        };
        let command = format!(
            "cam=ccdsoftCamera;img=ccdsoftCameraImage;\
             img.AttachToActiveImager();{}var Out=img.Save();Out+=\"\\n\";",
            path_assignment);
        if let Err(e) = self.send_checked(&command).await {
            warn!("Unable to save file {}: {}", file_name, e.message);
            return Err(e);
        }
        Ok(())
    }

    async fn autosave_path(&self) -> Result<String, CanonicalError> {
        let reply = self.send_checked(
            format!("var path=ccdsoftCamera.AutoSavePath;{}",
                    reply_with("path")).as_str()).await?;
        Ok(reply.trim().to_string())
    }

    async fn set_camera_cooling(&self, on: bool, target_celsius: f64)
                                -> Result<(), CanonicalError> {
        let set_point = if on {
            format!("ccdsoftCamera.TemperatureSetPoint={};", target_celsius)
        } else {
            String::new()
        };
        self.send_checked(
            format!("{}ccdsoftCamera.RegulateTemperature={};\
                     ccdsoftCamera.ShutDownTemperatureRegulationOnDisconnect={};",
                    set_point, js_bool(on), js_bool(false)).as_str()).await?;
        Ok(())
    }

    async fn camera_temperature(&self) -> Result<f64, CanonicalError> {
        let reply = self.send_checked(
            format!("var temp=ccdsoftCamera.Temperature;{}",
                    reply_with("temp")).as_str()).await?;
        let temperature = parse_number(&reply, "temperature")?;
        if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&temperature) {
            return Err(invalid_argument_error(
                format!("Invalid temperature {} returned", temperature).as_str()));
        }
        Ok(temperature)
    }

    async fn connect_telescope(&self) -> Result<(), CanonicalError> {
        self.send_checked("sky6RASCOMTele.Connect();").await?;
        Ok(())
    }

    async fn scope_alt_az(&self) -> Result<(f64, f64), CanonicalError> {
        let reply = self.send_checked(
            "sky6RASCOMTele.GetAzAlt();\
             var Out=sky6RASCOMTele.dAlt+'/'+sky6RASCOMTele.dAz;\
             Out+=\"\\n\";").await?;
        let parts: Vec<&str> = reply.split('/').collect();
        if parts.len() != 2 {
            return Err(invalid_argument_error(
                format!("Bad position \"{}\" from server", reply).as_str()));
        }
        let alt = parse_number(parts[0], "altitude")?;
        let az = parse_number(parts[1], "azimuth")?;
        Ok((alt, az))
    }

    async fn start_slew_to(&self, alt: f64, az: f64) -> Result<(), CanonicalError> {
        self.send_checked(
            format!("sky6RASCOMTele.Connect();sky6RASCOMTele.Asynchronous=1;\
                     var Out=sky6RASCOMTele.SlewToAzAlt({},{},'');Out+=\"\\n\";",
                    az, alt).as_str()).await?;
        Ok(())
    }

    async fn slew_to(&self, alt: f64, az: f64) -> Result<(), CanonicalError> {
        self.send_checked(
            format!("sky6RASCOMTele.Connect();sky6RASCOMTele.Asynchronous=0;\
                     var Out=sky6RASCOMTele.SlewToAzAlt({},{},'');Out+=\"\\n\";",
                    az, alt).as_str()).await?;
        Ok(())
    }

    async fn slew_is_complete(&self) -> Result<bool, CanonicalError> {
        self.query_bool("sky6RASCOMTele.IsSlewComplete").await
    }

    async fn abort_slew(&self) -> Result<(), CanonicalError> {
        self.send_checked("var Out=sky6RASCOMTele.Abort();Out+=\"\\n\";").await?;
        Ok(())
    }

    async fn home_mount(&self) -> Result<(), CanonicalError> {
        self.send_checked("sky6RASCOMTele.Connect();sky6RASCOMTele.FindHome();").await?;
        Ok(())
    }

    async fn set_tracking(&self, on: bool) -> Result<(), CanonicalError> {
        self.send_checked(
            format!("sky6RASCOMTele.SetTracking({}, 1, 0, 0);",
                    if on { 1 } else { 0 }).as_str()).await?;
        Ok(())
    }

    async fn park_mount(&self) -> Result<(), CanonicalError> {
        self.send_checked("sky6RASCOMTele.Park();").await?;
        Ok(())
    }

    async fn disconnect_telescope(&self) -> Result<(), CanonicalError> {
        self.send_checked("sky6RASCOMTele.Disconnect();").await?;
        Ok(())
    }
}

// mod tests.
