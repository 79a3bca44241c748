mod change_stream;
mod cursor;
